//! Connection handles as seen by the coordinator.
//!
//! A [`Peer`] is the coordinator's only view of a client connection: an
//! identity plus an outbound queue drained by the connection's writer
//! task. The transport owns the queue's receiving end; once it is
//! dropped the peer reports itself closed and is pruned on the next
//! operation that touches its group.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::ipc::protocol::CallResult;

/// Identity of one client connection. Compared by identity, never by
/// anything the client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell connections apart in logs.
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// Opaque per-window identifier chosen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceKey(pub i64);

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for InstanceKey {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

/// Work queued for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// Answer to a call the client made.
    Reply { id: u64, result: CallResult },
    /// Offer the main role for `instance`. The writer assigns the wire id
    /// and resolves `reply` when the client answers. Dropping `reply`
    /// without sending counts as a refusal.
    SetMain {
        instance: InstanceKey,
        reply: oneshot::Sender<bool>,
    },
    /// Ask the client to run an action payload.
    Execute { payload: Bytes },
}

/// Handle to one connected client.
#[derive(Debug, Clone)]
pub struct Peer {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Peer {
    /// Create a peer and the queue its writer task drains.
    ///
    /// The queue is unbounded: peers are local processes of the same user
    /// and are trusted to keep reading their socket. A client that stops
    /// reading while others broadcast to it grows its queue without limit
    /// until its connection closes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnectionId::new(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the transport side of this connection is still alive.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue an answer to call `id`.
    pub fn reply(&self, id: u64, result: CallResult) -> bool {
        self.tx.send(Outbound::Reply { id, result }).is_ok()
    }

    /// Queue an `Execute` callback. Returns `false` if the connection is
    /// already gone; the caller does not act on that beyond logging.
    pub fn execute(&self, payload: Bytes) -> bool {
        self.tx.send(Outbound::Execute { payload }).is_ok()
    }

    /// Offer the main role and wait for the client's answer.
    ///
    /// A closed connection, or one that goes away before answering,
    /// counts as a refusal. There is no timeout: local peers are
    /// trusted to answer.
    pub async fn set_main(&self, instance: InstanceKey) -> bool {
        let (reply, answer) = oneshot::channel();
        if self.tx.send(Outbound::SetMain { instance, reply }).is_err() {
            return false;
        }
        answer.await.unwrap_or(false)
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}
