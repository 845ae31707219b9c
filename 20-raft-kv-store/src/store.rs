//! In-memory key-value storage for the replicated state machine.
//!
//! This is the ground truth of application state on each node. Only the
//! state machine writes to it (one committed entry at a time, or a wholesale
//! restore); reads from request handlers run concurrently with those writes.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Thread-safe key-value map shared by the apply path and local readers.
///
/// An `RwLock` lets any number of `get` calls proceed together while the
/// single apply path takes the write side. [`StateMap::snapshot`] clones
/// under the read lock, so it can never see half of an apply.
#[derive(Debug, Default)]
pub struct StateMap {
    data: RwLock<HashMap<String, String>>,
}

impl StateMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    /// Stores a key-value pair, overwriting any existing value.
    pub fn insert(&self, key: String, value: String) {
        self.data.write().insert(key, value);
    }

    /// Removes a key. Removing an absent key is not an error.
    pub fn remove(&self, key: &str) {
        self.data.write().remove(key);
    }

    /// Retrieves the value this node has applied for `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Returns a point-in-time copy of every key-value pair.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.data.read().clone()
    }

    /// Replaces the entire contents with `data`. Nothing from before survives.
    pub fn replace(&self, data: HashMap<String, String>) {
        *self.data.write() = data;
    }
}
