//! Wire messages exchanged over the coordination socket.
//!
//! Every frame carries one MessagePack-encoded message (see
//! [`super::codec`]). Clients send [`ClientMessage`]s and receive
//! [`ServerMessage`]s. Calls and `SetMain` offers each carry an id chosen
//! by the side that initiates them; the answer echoes it back.

use serde::{Deserialize, Serialize};

use crate::coord::InstanceKey;

/// One RPC invocation on the coordination service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Call {
    Subscribe {
        session: String,
    },
    PushInstance {
        instance: InstanceKey,
    },
    DeleteInstance {
        instance: InstanceKey,
    },
    IsMainProcess,
    /// Returns `true` when the caller is main and should run the action
    /// itself.
    ExecuteOnMainProcess {
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    Broadcast {
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    GetTotalInstanceCount,
}

impl Call {
    /// Name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::PushInstance { .. } => "push_instance",
            Self::DeleteInstance { .. } => "delete_instance",
            Self::IsMainProcess => "is_main_process",
            Self::ExecuteOnMainProcess { .. } => "execute_on_main_process",
            Self::Broadcast { .. } => "broadcast",
            Self::GetTotalInstanceCount => "get_total_instance_count",
        }
    }
}

/// Result of a [`Call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallResult {
    /// Calls with no return value.
    Done,
    Bool(bool),
    Count(i32),
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Call { id: u64, call: Call },
    /// Answer to [`ServerMessage::SetMain`] with the same id.
    SetMainReply { id: u64, accepted: bool },
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    Reply {
        id: u64,
        result: CallResult,
    },
    /// Offer the main role for `instance`. The client must answer with
    /// [`ClientMessage::SetMainReply`].
    SetMain {
        id: u64,
        instance: InstanceKey,
    },
    Execute {
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
}
