//! Per-connection message pump.
//!
//! One task per client reads [`ClientMessage`]s and writes
//! [`ServerMessage`]s. Each call runs on its own task so a client can
//! keep answering `SetMain` offers (or make further calls) while an
//! earlier call is still waiting on an election. The task owns the
//! receiving end of the peer's outbound queue; returning from
//! [`serve_connection`] drops it, which is how the coordinator learns the
//! connection is closed.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::coord::{Coordinator, Outbound, Peer};
use crate::ipc::ServerCodec;
use crate::ipc::protocol::{ClientMessage, ServerMessage};

/// Drive one client connection until it closes or `shutdown` fires.
pub async fn serve_connection(stream: UnixStream, coordinator: Arc<Coordinator>, shutdown: CancellationToken) {
    let (peer, mut outbound) = Peer::channel();
    let conn = peer.id();
    tracing::debug!(conn = %conn, "client connected");

    let (reader, writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, ServerCodec::new());
    let mut sink = FramedWrite::new(writer, ServerCodec::new());

    // SetMain offers awaiting an answer, keyed by the id sent on the wire.
    // Dropped on exit, which resolves every waiter as a refusal.
    let mut offers: HashMap<u64, oneshot::Sender<bool>> = HashMap::new();
    let mut next_offer: u64 = 0;

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(ClientMessage::Call { id, call })) => {
                    let coordinator = coordinator.clone();
                    let peer = peer.clone();
                    tokio::spawn(async move {
                        let name = call.name();
                        let result = coordinator.dispatch(&peer, call).await;
                        tracing::trace!(conn = %peer.id(), id, call = name, ?result, "call complete");
                        if !peer.reply(id, result) {
                            tracing::debug!(conn = %peer.id(), id, call = name, "connection closed before reply");
                        }
                    });
                }
                Some(Ok(ClientMessage::SetMainReply { id, accepted })) => match offers.remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(accepted);
                    }
                    None => tracing::warn!(conn = %conn, id, "reply to unknown SetMain offer"),
                },
                Some(Err(e)) => {
                    tracing::warn!(conn = %conn, error = %e, "dropping connection after read error");
                    break;
                }
                None => {
                    tracing::debug!(conn = %conn, "client disconnected (EOF)");
                    break;
                }
            },

            // `peer` keeps a sender alive, so this never yields `None`.
            Some(out) = outbound.recv() => {
                let msg = match out {
                    Outbound::Reply { id, result } => ServerMessage::Reply { id, result },
                    Outbound::SetMain { instance, reply } => {
                        let id = next_offer;
                        next_offer += 1;
                        offers.insert(id, reply);
                        ServerMessage::SetMain { id, instance }
                    }
                    Outbound::Execute { payload } => ServerMessage::Execute {
                        payload: payload.to_vec(),
                    },
                };
                if let Err(e) = sink.send(msg).await {
                    tracing::warn!(conn = %conn, error = %e, "dropping connection after write error");
                    break;
                }
            }

            _ = shutdown.cancelled() => {
                tracing::debug!(conn = %conn, "closing connection for shutdown");
                break;
            }
        }
    }

    if !offers.is_empty() {
        tracing::debug!(conn = %conn, pending = offers.len(), "unanswered SetMain offers count as refusals");
    }
    tracing::info!(conn = %conn, "connection closed");
}
