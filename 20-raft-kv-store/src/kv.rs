//! The store facade used by the front end.
//!
//! Writes are leader-gated and go through the consensus engine; reads are
//! answered from the local [`StateMap`] without consensus, trading
//! linearizability for latency. Membership ([`Store::join`]) and topology
//! ([`Store::status`]) live in their own modules.

use std::sync::Arc;

use tracing::debug;

use crate::command::Command;
use crate::config::StoreConfig;
use crate::consensus::Consensus;
use crate::error::StoreError;
use crate::store::StateMap;

pub struct Store<C> {
    state: Arc<StateMap>,
    consensus: Arc<C>,
    config: StoreConfig,
}

impl<C: Consensus> Store<C> {
    /// Wraps `state` (the map the engine's state machine applies to) and
    /// the engine itself.
    pub fn new(state: Arc<StateMap>, consensus: Arc<C>, config: StoreConfig) -> Self {
        Self {
            state,
            consensus,
            config,
        }
    }

    pub fn consensus(&self) -> &Arc<C> {
        &self.consensus
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Reads `key` from this node's applied state.
    ///
    /// An absent key yields `""` rather than an error, so a key holding an
    /// empty string looks the same as one never set. Use [`Store::lookup`]
    /// to tell them apart.
    pub fn get(&self, key: &str) -> String {
        self.lookup(key).unwrap_or_default()
    }

    /// Reads `key`, returning `None` when it is not present.
    pub fn lookup(&self, key: &str) -> Option<String> {
        self.state.get(key)
    }

    /// Sets `key` to `value` through consensus.
    ///
    /// Returns once the entry is committed and applied on this node.
    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.replicate(Command::set(key, value))
    }

    /// Deletes `key` through consensus. Deleting an absent key succeeds.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.replicate(Command::delete(key))
    }

    /// Submits `command` if this node leads.
    ///
    /// A follower refuses before anything reaches the log. A timeout means
    /// the outcome is unknown, not that the write was dropped.
    fn replicate(&self, command: Command) -> Result<(), StoreError> {
        if !self.consensus.is_leader() {
            return Err(StoreError::NotLeader);
        }
        let data = command.encode()?;
        debug!(op = command.op(), key = command.key(), "submitting command");
        self.consensus
            .submit(data, self.config.apply_timeout)
            .map_err(StoreError::from)
    }
}
