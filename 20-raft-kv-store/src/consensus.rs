//! The consensus engine as seen from the replicated store.
//!
//! Leader election, replication and quorum commit live behind the
//! [`Consensus`] trait. The store only needs to submit entries, ask who
//! leads, and edit the voter set. [`crate::engine`] implements it on top of
//! tikv/raft; [`crate::testing::LocalCluster`] implements it in memory.

use std::time::Duration;

use thiserror::Error;

use crate::topology::Node;

/// Whether a configured server takes part in quorum decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suffrage {
    Voter,
    Nonvoter,
}

/// One entry of the engine's membership configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub id: String,
    pub address: String,
    pub suffrage: Suffrage,
}

impl Server {
    pub fn voter(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            suffrage: Suffrage::Voter,
        }
    }

    pub fn is_voter(&self) -> bool {
        self.suffrage == Suffrage::Voter
    }

    pub fn node(&self) -> Node {
        Node::new(&self.id, &self.address)
    }
}

/// Errors reported by a consensus engine. The store passes these through
/// to its callers without rewriting them.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("not leader")]
    NotLeader,
    /// The entry was not confirmed in time. It may still commit later.
    #[error("timed out after {0:?} waiting for commit")]
    Timeout(Duration),
    #[error("consensus engine has shut down")]
    Shutdown,
    /// The apply loop hit an unrecoverable error and the node stopped.
    #[error("node halted: {0}")]
    Halted(String),
    #[error("unknown server {0}")]
    UnknownServer(String),
    #[error("raft error: {0}")]
    Raft(String),
}

/// The capability the store consumes from its consensus engine.
///
/// Calls block until the engine answers; implementations must be usable from
/// many request threads at once.
pub trait Consensus: Send + Sync {
    /// Whether this node currently holds leadership.
    fn is_leader(&self) -> bool;

    /// The current leader, or `None` while no leader is known.
    fn leader(&self) -> Result<Option<Node>, ConsensusError>;

    /// The current membership configuration.
    fn configuration(&self) -> Result<Vec<Server>, ConsensusError>;

    /// Appends `data` to the log and waits until it is committed and applied
    /// locally, or until `timeout` elapses.
    fn submit(&self, data: Vec<u8>, timeout: Duration) -> Result<(), ConsensusError>;

    /// Adds a voting member. `prev_index` of 0 means no precondition.
    fn add_voter(
        &self,
        id: &str,
        address: &str,
        prev_index: u64,
        timeout: Duration,
    ) -> Result<(), ConsensusError>;

    /// Removes a member by id. `prev_index` of 0 means no precondition.
    fn remove_server(&self, id: &str, prev_index: u64, timeout: Duration)
        -> Result<(), ConsensusError>;
}
