//! Session registry and connection index.
//!
//! Groups are created on first subscribe and live for the lifetime of the
//! server. The connection index maps each subscribed connection to the
//! session it currently belongs to, so calls other than `subscribe` never
//! need to repeat the session id.

use std::collections::HashMap;
use std::sync::Arc;

use super::group::Group;
use super::peer::ConnectionId;

/// Session identifier supplied by clients on subscribe.
pub type SessionId = Arc<str>;

#[derive(Debug, Default)]
pub struct Registry {
    groups: HashMap<SessionId, Group>,
    index: HashMap<ConnectionId, SessionId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the group for `session`, creating it if this is the first
    /// time the id is seen.
    pub fn group_or_insert(&mut self, session: &str) -> (SessionId, &mut Group) {
        let key = match self.groups.get_key_value(session) {
            Some((key, _)) => key.clone(),
            None => {
                let key: SessionId = Arc::from(session);
                tracing::debug!(session = %key, "creating session group");
                self.groups.insert(key.clone(), Group::new());
                key
            }
        };
        let group = self.groups.entry(key.clone()).or_default();
        (key, group)
    }

    pub fn group_mut(&mut self, session: &str) -> Option<&mut Group> {
        self.groups.get_mut(session)
    }

    /// Session the connection is currently bound to.
    pub fn session_of(&self, id: ConnectionId) -> Option<SessionId> {
        self.index.get(&id).cloned()
    }

    /// Bind `id` to `session`, returning the session it was bound to
    /// before, if any.
    pub fn bind(&mut self, id: ConnectionId, session: SessionId) -> Option<SessionId> {
        self.index.insert(id, session)
    }

    /// Drop index entries for connections found closed.
    pub fn forget(&mut self, closed: &[ConnectionId]) {
        for id in closed {
            self.index.remove(id);
        }
    }

    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.groups.len()
    }
}
