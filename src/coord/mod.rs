//! Coordination service: session groups, instance stacks and main election.
//!
//! All state sits behind one lock owned by [`Coordinator`]. The lock is
//! held only while reading or mutating state; it is never held across a
//! round trip to a client. Deliveries are computed under the lock and
//! performed after it is released, so a client may call back into the
//! service from inside a callback without deadlocking.
//!
//! Dead connections are noticed lazily: each operation first prunes the
//! caller's group, dropping members whose connection has closed and the
//! instances they owned. If that removes the main, the group elects a new
//! one before the operation proceeds.

pub mod group;
pub mod peer;
pub mod registry;
pub mod stack_map;


use bytes::Bytes;
use tokio::sync::{Mutex, MutexGuard};

use crate::ipc::protocol::{Call, CallResult};

pub use group::{Group, Removal};
pub use peer::{ConnectionId, InstanceKey, Outbound, Peer};
pub use registry::{Registry, SessionId};
pub use stack_map::{EmptyStack, StackMap};

/// Server context holding every session group.
///
/// One instance lives for the lifetime of the server; tests build as many
/// independent ones as they need.
#[derive(Debug, Default)]
pub struct Coordinator {
    state: Mutex<Registry>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one decoded call on behalf of `caller`.
    pub async fn dispatch(&self, caller: &Peer, call: Call) -> CallResult {
        match call {
            Call::Subscribe { session } => {
                self.subscribe(caller, &session).await;
                CallResult::Done
            }
            Call::PushInstance { instance } => {
                self.push_instance(caller, instance).await;
                CallResult::Done
            }
            Call::DeleteInstance { instance } => {
                self.delete_instance(caller, instance).await;
                CallResult::Done
            }
            Call::IsMainProcess => CallResult::Bool(self.is_main_process(caller).await),
            Call::ExecuteOnMainProcess { payload } => {
                CallResult::Bool(self.execute_on_main_process(caller, payload.into()).await)
            }
            Call::Broadcast { payload } => {
                self.broadcast(caller, payload.into()).await;
                CallResult::Done
            }
            Call::GetTotalInstanceCount => {
                CallResult::Count(self.total_instance_count(caller).await)
            }
        }
    }

    /// Join the group for `session`, creating it on first use.
    ///
    /// A connection belongs to at most one group: subscribing elsewhere
    /// detaches it from its previous group along with its instances.
    /// Subscribing from a connection that has already closed does nothing.
    pub async fn subscribe(&self, caller: &Peer, session: &str) {
        if !caller.is_open() {
            tracing::debug!(conn = %caller.id(), session, "subscribe from closed connection ignored");
            return;
        }

        let mut elections = Vec::new();
        {
            let mut state = self.state.lock().await;
            let (session, _) = state.group_or_insert(session);
            if prune_group(&mut state, &session) {
                elections.push(session.clone());
            }

            if let Some(previous) = state.bind(caller.id(), session.clone())
                && previous != session
                && let Some(group) = state.group_mut(&previous)
            {
                tracing::debug!(conn = %caller.id(), from = %previous, to = %session, "moving subscription");
                if group.detach(caller.id()).needs_election {
                    elections.push(previous);
                }
            }

            if let Some(group) = state.group_mut(&session)
                && group.subscribe(caller.clone())
            {
                tracing::info!(conn = %caller.id(), session = %session, "subscribed");
            }
        }

        for session in elections {
            self.elect(&session).await;
        }
    }

    /// Push (or re-push) an instance owned by the caller, making it main.
    ///
    /// Ignored unless the caller is subscribed to its group.
    pub async fn push_instance(&self, caller: &Peer, instance: InstanceKey) {
        let (mut state, session) = self.lock_for(caller.id()).await;
        let Some(group) = session.as_deref().and_then(|s| state.group_mut(s)) else {
            tracing::debug!(conn = %caller.id(), %instance, "push from unsubscribed connection ignored");
            return;
        };
        if !group.is_member(caller.id()) {
            tracing::debug!(conn = %caller.id(), %instance, "push from non-member ignored");
            return;
        }

        group.push(instance, caller.id());
        tracing::debug!(
            conn = %caller.id(),
            %instance,
            count = group.instance_count(),
            "instance pushed, now main"
        );
    }

    /// Remove an instance. Removing the main starts an election among the
    /// remaining instances, which completes before this returns unless
    /// another election for the group was already under way.
    pub async fn delete_instance(&self, caller: &Peer, instance: InstanceKey) {
        let (mut state, session) = self.lock_for(caller.id()).await;
        let Some(session) = session else {
            return;
        };
        let Some(group) = state.group_mut(&session) else {
            return;
        };

        let removal = group.remove_instance(instance);
        tracing::debug!(conn = %caller.id(), %instance, ?removal, "instance deleted");
        drop(state);

        if removal == Removal::WasTop {
            self.elect(&session).await;
        }
    }

    /// Whether the caller owns its group's main instance.
    pub async fn is_main_process(&self, caller: &Peer) -> bool {
        let (mut state, session) = self.lock_for(caller.id()).await;
        session
            .as_deref()
            .and_then(|s| state.group_mut(s))
            .is_some_and(|group| group.is_main(caller.id()))
    }

    /// Route `payload` to the main.
    ///
    /// Returns `true` when the caller is itself main and should run the
    /// action locally; nothing is delivered in that case. Otherwise the
    /// payload goes to the main's connection, if there is one, and the
    /// result is `false`.
    pub async fn execute_on_main_process(&self, caller: &Peer, payload: Bytes) -> bool {
        let target = {
            let (mut state, session) = self.lock_for(caller.id()).await;
            let Some(group) = session.as_deref().and_then(|s| state.group_mut(s)) else {
                return false;
            };
            if group.is_main(caller.id()) {
                return true;
            }
            group.top().map(|(instance, peer)| (instance, peer.clone()))
        };

        match target {
            Some((instance, main)) => {
                if !main.execute(payload) {
                    tracing::debug!(conn = %main.id(), %instance, "main went away before forwarding");
                }
            }
            None => tracing::debug!(conn = %caller.id(), "no main to forward to"),
        }
        false
    }

    /// Deliver `payload` to every other member of the caller's group.
    ///
    /// Recipients are captured now; delivery happens on a separate task
    /// and this returns without waiting for it.
    pub async fn broadcast(&self, caller: &Peer, payload: Bytes) {
        let recipients = {
            let (mut state, session) = self.lock_for(caller.id()).await;
            match session.as_deref().and_then(|s| state.group_mut(s)) {
                Some(group) => group.others(caller.id()),
                None => return,
            }
        };
        if recipients.is_empty() {
            return;
        }

        tracing::debug!(conn = %caller.id(), recipients = recipients.len(), "broadcasting");
        tokio::spawn(async move {
            for peer in recipients {
                if !peer.execute(payload.clone()) {
                    tracing::debug!(conn = %peer.id(), "broadcast recipient gone");
                }
            }
        });
    }

    /// Number of instances in the caller's group.
    pub async fn total_instance_count(&self, caller: &Peer) -> i32 {
        let (mut state, session) = self.lock_for(caller.id()).await;
        let count = session
            .as_deref()
            .and_then(|s| state.group_mut(s))
            .map_or(0, |group| group.instance_count());
        i32::try_from(count).unwrap_or(i32::MAX)
    }

    /// Lock state with the caller's group pruned and its main settled.
    ///
    /// Returns the caller's session, or `None` if it never subscribed.
    async fn lock_for(&self, caller: ConnectionId) -> (MutexGuard<'_, Registry>, Option<SessionId>) {
        loop {
            let mut state = self.state.lock().await;
            let Some(session) = state.session_of(caller) else {
                return (state, None);
            };
            if !prune_group(&mut state, &session) {
                return (state, Some(session));
            }
            drop(state);
            self.elect(&session).await;
        }
    }

    /// Find a live instance willing to be main.
    ///
    /// Offers the role to the top of the stack. A refusal, or an owner
    /// that has gone away, pops that instance and the next one is asked.
    /// Ends when an owner accepts, an instance is pushed, or the stack is
    /// empty. The lock is released while waiting for each answer and the
    /// group is re-checked afterwards.
    ///
    /// At most one election runs per group. A request made while one is
    /// running returns at once: the running election re-reads the stack
    /// after every answer and so covers whatever the request was about.
    async fn elect(&self, session: &SessionId) {
        {
            let mut state = self.state.lock().await;
            let Some(group) = state.group_mut(session) else {
                return;
            };
            if !group.begin_election() {
                tracing::debug!(session = %session, "election already running");
                return;
            }
        }

        loop {
            let (instance, candidate) = {
                let mut state = self.state.lock().await;
                prune_group(&mut state, session);
                let Some(group) = state.group_mut(session) else {
                    return;
                };
                let top = group
                    .needs_main()
                    .then(|| group.top().map(|(instance, peer)| (instance, peer.clone())))
                    .flatten();
                match top {
                    Some(top) => top,
                    None => {
                        if group.instance_count() == 0 {
                            tracing::info!(session = %session, "no instances left, group has no main");
                        }
                        group.end_election();
                        return;
                    }
                }
            };

            tracing::debug!(session = %session, conn = %candidate.id(), %instance, "offering main");
            let accepted = candidate.set_main(instance).await;

            let mut state = self.state.lock().await;
            let Some(group) = state.group_mut(session) else {
                return;
            };
            if accepted {
                if group.settle(instance, candidate.id()) {
                    tracing::info!(session = %session, conn = %candidate.id(), %instance, "new main elected");
                }
            } else if group.pop_if_top(instance, candidate.id()) {
                tracing::debug!(session = %session, conn = %candidate.id(), %instance, "main refused, popped");
            }
        }
    }
}

/// Drop closed connections from `session`'s group and the connection
/// index. Returns whether the group lost its main and needs an election.
fn prune_group(state: &mut Registry, session: &str) -> bool {
    let Some(group) = state.group_mut(session) else {
        return false;
    };
    let pruned = group.prune();
    if !pruned.closed.is_empty() {
        tracing::debug!(session, closed = pruned.closed.len(), "pruned closed connections");
        state.forget(&pruned.closed);
    }
    pruned.needs_election
}
