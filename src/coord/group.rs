//! Per-session group state: subscribed connections plus the instance stack.

use std::collections::HashMap;

use super::peer::{ConnectionId, InstanceKey, Peer};
use super::stack_map::StackMap;

/// Outcome of removing an instance from a group's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    NotPresent,
    /// Removed from below the top; main status is unaffected.
    Buried,
    /// Removed the top; the group has lost its main.
    WasTop,
}

/// Result of dropping connections from a group.
#[derive(Debug, Default)]
pub struct Pruned {
    /// Connections removed from the group.
    pub closed: Vec<ConnectionId>,
    /// The main's owner was removed and other instances remain, so a new
    /// main has to be elected.
    pub needs_election: bool,
}

/// Connections and instances belonging to one session id.
///
/// Every instance owner is also a subscribed connection: instances are
/// only pushed by members, and removing a member removes its instances.
#[derive(Debug, Default)]
pub struct Group {
    callbacks: HashMap<ConnectionId, Peer>,
    instances: StackMap<InstanceKey, ConnectionId>,
    /// The top of the stack holds the main role: it was pushed, or its
    /// owner accepted an offer. Cleared whenever the top is removed.
    settled: bool,
    /// An election is running for this group.
    electing: bool,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `peer` to the callbacks set. Returns `false` if it was already
    /// a member.
    pub fn subscribe(&mut self, peer: Peer) -> bool {
        self.callbacks.insert(peer.id(), peer).is_none()
    }

    pub fn is_member(&self, id: ConnectionId) -> bool {
        self.callbacks.contains_key(&id)
    }

    /// Push (or re-push) `key` for `owner`, making it the main.
    pub fn push(&mut self, key: InstanceKey, owner: ConnectionId) {
        debug_assert!(self.is_member(owner));
        self.instances.push(key, owner);
        self.settled = true;
    }

    /// Whether the top needs to be offered the main role.
    pub fn needs_main(&self) -> bool {
        !self.settled && !self.instances.is_empty()
    }

    /// Record that the owner of `key` accepted the main role, if `key` is
    /// still the top and nothing claimed the role in the meantime.
    pub fn settle(&mut self, key: InstanceKey, owner: ConnectionId) -> bool {
        if self.settled || !self.is_top(key, owner) {
            return false;
        }
        self.settled = true;
        true
    }

    /// Mark an election as running. Returns `false` if one already is; the
    /// running election picks up whatever changed in the meantime.
    pub fn begin_election(&mut self) -> bool {
        !std::mem::replace(&mut self.electing, true)
    }

    pub fn end_election(&mut self) {
        self.electing = false;
    }

    /// The main instance and the peer that owns it.
    pub fn top(&self) -> Option<(InstanceKey, &Peer)> {
        let (key, owner) = self.instances.peek().ok()?;
        self.callbacks.get(owner).map(|peer| (*key, peer))
    }

    pub fn is_main(&self, id: ConnectionId) -> bool {
        matches!(self.instances.peek(), Ok((_, owner)) if *owner == id)
    }

    pub fn remove_instance(&mut self, key: InstanceKey) -> Removal {
        let was_top = matches!(self.instances.peek(), Ok((top, _)) if *top == key);
        if !self.instances.remove(&key) {
            Removal::NotPresent
        } else if was_top {
            self.settled = false;
            Removal::WasTop
        } else {
            Removal::Buried
        }
    }

    fn is_top(&self, key: InstanceKey, owner: ConnectionId) -> bool {
        matches!(self.instances.peek(), Ok((k, o)) if *k == key && *o == owner)
    }

    /// Pop the top if it is still the unsettled `key` owned by `owner`.
    ///
    /// An instance that was re-pushed while its offer was pending holds the
    /// main role again and stays.
    pub fn pop_if_top(&mut self, key: InstanceKey, owner: ConnectionId) -> bool {
        if self.settled || !self.is_top(key, owner) {
            return false;
        }
        self.instances
            .pop()
            .expect("stack cannot be empty, its top was just checked");
        true
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Every member except `except`.
    pub fn others(&self, except: ConnectionId) -> Vec<Peer> {
        self.callbacks
            .values()
            .filter(|peer| peer.id() != except)
            .cloned()
            .collect()
    }

    /// Drop members whose connection has closed, along with their
    /// instances.
    pub fn prune(&mut self) -> Pruned {
        let closed: Vec<ConnectionId> = self
            .callbacks
            .values()
            .filter(|peer| !peer.is_open())
            .map(Peer::id)
            .collect();
        self.drop_members(closed)
    }

    /// Remove a single member and its instances regardless of liveness.
    pub fn detach(&mut self, id: ConnectionId) -> Pruned {
        if self.is_member(id) {
            self.drop_members(vec![id])
        } else {
            Pruned::default()
        }
    }

    fn drop_members(&mut self, closed: Vec<ConnectionId>) -> Pruned {
        if closed.is_empty() {
            return Pruned::default();
        }
        let top_before = self.instances.peek().ok().map(|(key, _)| *key);

        for id in &closed {
            self.callbacks.remove(id);
        }
        let callbacks = &self.callbacks;
        self.instances.remove_where(|owner| !callbacks.contains_key(owner));

        let top_after = self.instances.peek().ok().map(|(key, _)| *key);
        if top_before != top_after {
            self.settled = false;
        }
        let needs_election = top_before.is_some() && top_after.is_some() && top_before != top_after;

        Pruned {
            closed,
            needs_election,
        }
    }
}
