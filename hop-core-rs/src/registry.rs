//! Ordered per-operation subscriber registries
//!
//! Handlers, filters and observation hooks are kept per operation tag in
//! registration order. Fan-out selection uses that order as its tie-break,
//! so `snapshot` always returns subscribers oldest first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Tag matching every operation
pub const ANY_ACTION: &str = "*";

/// Handle returned by `register`, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

pub struct Registry<T: Clone> {
    next_id: AtomicU64,
    entries: RwLock<HashMap<String, Vec<(RegistrationId, T)>>>,
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, action: &str, item: T) -> RegistrationId {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .entry(action.to_string())
            .or_default()
            .push((id, item));
        id
    }

    pub fn unregister(&self, id: RegistrationId) -> bool {
        let mut entries = self.entries.write();
        for list in entries.values_mut() {
            if let Some(pos) = list.iter().position(|(rid, _)| *rid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Subscribers for `action` in registration order
    pub fn snapshot(&self, action: &str) -> Vec<T> {
        self.entries
            .read()
            .get(action)
            .map(|list| list.iter().map(|(_, item)| item.clone()).collect())
            .unwrap_or_default()
    }

    /// Subscribers for `action` followed by those registered for every action
    pub fn snapshot_with_wildcard(&self, action: &str) -> Vec<T> {
        let mut items = self.snapshot(action);
        if action != ANY_ACTION {
            items.extend(self.snapshot(ANY_ACTION));
        }
        items
    }

    pub fn count(&self, action: &str) -> usize {
        self.entries.read().get(action).map_or(0, Vec::len)
    }

    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(action, _)| action.clone())
            .collect();
        actions.sort();
        actions
    }
}
