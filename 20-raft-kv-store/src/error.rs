//! Errors surfaced by the store to its front end.

use std::time::Duration;

use thiserror::Error;

use crate::command::CodecError;
use crate::consensus::ConsensusError;
use crate::topology::Node;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Writes and membership changes are only accepted by the leader.
    /// Retry against the leader reported by `status`.
    #[error("not leader")]
    NotLeader,

    /// The entry did not commit within the bound. Its outcome is unknown:
    /// it may still commit, so callers must not treat this as a rollback.
    #[error("entry not committed within {0:?}; outcome unknown")]
    CommitTimeout(Duration),

    #[error("failed to encode command: {0}")]
    Encode(#[from] CodecError),

    /// A join could not remove a stale entry. Entries listed in `removed`
    /// were already taken out of the configuration.
    #[error("error removing existing node {existing} for join of {id} at {addr}: {source}")]
    RemoveExisting {
        id: String,
        addr: String,
        existing: Node,
        removed: Vec<Node>,
        #[source]
        source: ConsensusError,
    },

    /// A join removed stale entries but then failed to add the node.
    #[error("error adding voter {id} at {addr} (removed {} stale entries first): {source}", .removed.len())]
    AddVoter {
        id: String,
        addr: String,
        removed: Vec<Node>,
        #[source]
        source: ConsensusError,
    },

    #[error(transparent)]
    Consensus(ConsensusError),
}

impl From<ConsensusError> for StoreError {
    fn from(err: ConsensusError) -> Self {
        match err {
            ConsensusError::NotLeader => StoreError::NotLeader,
            ConsensusError::Timeout(timeout) => StoreError::CommitTimeout(timeout),
            other => StoreError::Consensus(other),
        }
    }
}

impl StoreError {
    /// True when the failure left the membership partly changed.
    pub fn is_partial_membership_change(&self) -> bool {
        match self {
            StoreError::RemoveExisting { removed, .. } | StoreError::AddVoter { removed, .. } => {
                !removed.is_empty()
            }
            _ => false,
        }
    }
}
