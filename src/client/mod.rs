//! Async client for the coordination socket.
//!
//! [`Client::connect`] returns the client plus a stream of
//! [`ClientEvent`]s carrying the server's callbacks. A background task
//! owns the socket; calls are matched to replies by id, so the event
//! consumer may call back into the client while handling an event.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::coord::InstanceKey;
use crate::ipc::protocol::{Call, CallResult, ClientMessage, ServerMessage};
use crate::ipc::{ClientCodec, IpcError};

/// Client-side failure.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error("connection to the coordination server closed")]
    Disconnected,
    #[error("unexpected reply {0:?}")]
    UnexpectedReply(CallResult),
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        Self::Ipc(IpcError::Io(e))
    }
}

/// Callback delivered by the server.
#[derive(Debug)]
pub enum ClientEvent {
    /// The server offers the main role for `instance`. Answer through
    /// `reply`; dropping it declines.
    SetMain {
        instance: InstanceKey,
        reply: SetMainReply,
    },
    /// Run an action payload sent by another client.
    Execute { payload: Vec<u8> },
}

/// Answer handle for a [`ClientEvent::SetMain`] offer.
#[derive(Debug)]
pub struct SetMainReply {
    id: u64,
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
}

impl SetMainReply {
    pub fn accept(mut self) {
        self.answer(true);
    }

    pub fn decline(mut self) {
        self.answer(false);
    }

    fn answer(&mut self, accepted: bool) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(ClientMessage::SetMainReply { id: self.id, accepted });
        }
    }
}

impl Drop for SetMainReply {
    fn drop(&mut self) {
        self.answer(false);
    }
}

/// Calls waiting for a reply. `None` once the connection has closed.
type Pending = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<CallResult>>>>>;

/// Connection to a coordination server.
pub struct Client {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    pending: Pending,
    next_id: AtomicU64,
    task: JoinHandle<()>,
}

impl Client {
    /// Connect to the server listening at `path`.
    pub async fn connect(path: &Path) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        let stream = UnixStream::connect(path).await?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));

        let task = tokio::spawn(drive(stream, outbound.clone(), outbound_rx, events_tx, pending.clone()));

        Ok((
            Self {
                outbound,
                pending,
                next_id: AtomicU64::new(0),
                task,
            },
            events,
        ))
    }

    pub async fn subscribe(&self, session: &str) -> Result<(), ClientError> {
        self.call_done(Call::Subscribe {
            session: session.to_string(),
        })
        .await
    }

    pub async fn push_instance(&self, instance: InstanceKey) -> Result<(), ClientError> {
        self.call_done(Call::PushInstance { instance }).await
    }

    pub async fn delete_instance(&self, instance: InstanceKey) -> Result<(), ClientError> {
        self.call_done(Call::DeleteInstance { instance }).await
    }

    pub async fn is_main_process(&self) -> Result<bool, ClientError> {
        match self.call(Call::IsMainProcess).await? {
            CallResult::Bool(main) => Ok(main),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    /// Returns `true` when this client is main and should run the action
    /// itself; otherwise the server forwarded it (if a main exists).
    pub async fn execute_on_main_process(&self, payload: &[u8]) -> Result<bool, ClientError> {
        let call = Call::ExecuteOnMainProcess {
            payload: payload.to_vec(),
        };
        match self.call(call).await? {
            CallResult::Bool(local) => Ok(local),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    pub async fn broadcast(&self, payload: &[u8]) -> Result<(), ClientError> {
        self.call_done(Call::Broadcast {
            payload: payload.to_vec(),
        })
        .await
    }

    pub async fn total_instance_count(&self) -> Result<i32, ClientError> {
        match self.call(Call::GetTotalInstanceCount).await? {
            CallResult::Count(count) => Ok(count),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    async fn call_done(&self, call: Call) -> Result<(), ClientError> {
        match self.call(call).await? {
            CallResult::Done => Ok(()),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    async fn call(&self, call: Call) -> Result<CallResult, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            let Some(waiting) = pending.as_mut() else {
                return Err(ClientError::Disconnected);
            };
            waiting.insert(id, tx);
        }

        self.outbound
            .send(ClientMessage::Call { id, call })
            .map_err(|_| ClientError::Disconnected)?;
        rx.await.map_err(|_| ClientError::Disconnected)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Socket pump: writes queued messages, routes replies to their callers
/// and callbacks to the event stream.
async fn drive(
    stream: UnixStream,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
    events: mpsc::UnboundedSender<ClientEvent>,
    pending: Pending,
) {
    let (reader, writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, ClientCodec::new());
    let mut sink = FramedWrite::new(writer, ClientCodec::new());

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(ServerMessage::Reply { id, result })) => {
                    let waiter = pending.lock().await.as_mut().and_then(|waiting| waiting.remove(&id));
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(result);
                        }
                        None => tracing::warn!(id, "reply to unknown call"),
                    }
                }
                Some(Ok(ServerMessage::SetMain { id, instance })) => {
                    let reply = SetMainReply {
                        id,
                        outbound: Some(outbound.clone()),
                    };
                    // A dropped event stream declines through `reply`'s drop.
                    let _ = events.send(ClientEvent::SetMain { instance, reply });
                }
                Some(Ok(ServerMessage::Execute { payload })) => {
                    let _ = events.send(ClientEvent::Execute { payload });
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "coordination connection failed");
                    break;
                }
                None => {
                    tracing::debug!("coordination server closed the connection");
                    break;
                }
            },

            // The client handle keeps a sender alive while it exists.
            Some(msg) = outbound_rx.recv() => {
                if let Err(e) = sink.send(msg).await {
                    tracing::warn!(error = %e, "failed to write to coordination server");
                    break;
                }
            }
        }
    }

    // Fail every outstanding and future call.
    pending.lock().await.take();
}
