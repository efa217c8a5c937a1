//! Keyed LIFO stack backing each group's instance stack.
//!
//! Entries are kept in promotion order: the last entry is the top.
//! Pushing a key that is already present moves it to the top instead of
//! duplicating it, so re-announcing an instance refreshes its recency.
//!
//! Backed by an [`IndexMap`]. `push` of a new key, `peek` and `pop` are
//! O(1); promoting an existing key, `remove` and `remove_where` shift the
//! tail of the order sequence and are O(n).

use std::hash::Hash;

use indexmap::IndexMap;

/// Returned by [`StackMap::peek`] and [`StackMap::pop`] on an empty stack.
///
/// Callers are expected to check [`StackMap::is_empty`] or match on the
/// result; reaching this error means the caller sequenced its operations
/// wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stack map is empty")]
pub struct EmptyStack;

/// Ordered map with stack semantics on its most recent entry.
#[derive(Debug, Clone)]
pub struct StackMap<K, V> {
    entries: IndexMap<K, V>,
}

impl<K, V> Default for StackMap<K, V> {
    fn default() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }
}

impl<K: Hash + Eq, V> StackMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push `key` as the new top.
    ///
    /// An existing entry for `key` is moved to the top and its value
    /// replaced; the count does not change in that case.
    pub fn push(&mut self, key: K, value: V) {
        self.entries.shift_remove(&key);
        self.entries.insert(key, value);
    }

    /// Top entry, without removing it.
    pub fn peek(&self) -> Result<(&K, &V), EmptyStack> {
        self.entries.last().ok_or(EmptyStack)
    }

    /// Remove and return the top entry.
    pub fn pop(&mut self) -> Result<(K, V), EmptyStack> {
        self.entries.pop().ok_or(EmptyStack)
    }

    /// Remove `key` wherever it sits. Survivors keep their relative order.
    pub fn remove(&mut self, key: &K) -> bool {
        self.entries.shift_remove(key).is_some()
    }

    /// Remove every entry whose value matches `pred`, returning how many
    /// were removed.
    pub fn remove_where<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&V) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|_, value| !pred(value));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries from bottom to top.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }
}
