//! Cluster topology as seen from one node.
//!
//! Nothing here is stored; [`ClusterStatus`] is recomputed from the engine's
//! live configuration and leadership every time it is asked for.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::consensus::{Consensus, Server};
use crate::error::StoreError;
use crate::kv::Store;

/// A member of the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
}

impl Node {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Who this node is, who leads, and everyone else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub me: Node,
    pub leader: Node,
    /// Every voter whose id is not the leader's. This includes the local node
    /// whenever it is not the leader.
    pub followers: Vec<Node>,
    /// Set when no voter carries this node's address and `me` only has the
    /// address filled in.
    #[serde(skip)]
    pub degraded: bool,
}

impl ClusterStatus {
    /// Builds the view from the engine's answers.
    ///
    /// `leader` is an empty [`Node`] while no leader is known, in which case
    /// every voter ends up in `followers`.
    pub fn compute(local_addr: &str, leader: Node, servers: &[Server]) -> Self {
        let mut me = None;
        let mut followers = Vec::new();
        for server in servers.iter().filter(|server| server.is_voter()) {
            if server.id != leader.id {
                followers.push(server.node());
            }
            if server.address == local_addr {
                me = Some(server.node());
            }
        }

        let degraded = me.is_none();
        Self {
            me: me.unwrap_or_else(|| Node::new("", local_addr)),
            leader,
            followers,
            degraded,
        }
    }
}

impl<C: Consensus> Store<C> {
    /// Reports this node, the leader and the followers.
    ///
    /// Reads only; the only failure is not being able to reach the engine.
    pub fn status(&self) -> Result<ClusterStatus, StoreError> {
        let leader = self.consensus().leader()?.unwrap_or_default();
        let servers = self.consensus().configuration()?;
        let status = ClusterStatus::compute(&self.config().raft_addr, leader, &servers);
        if status.degraded {
            warn!(
                addr = %self.config().raft_addr,
                "local address not found in cluster configuration"
            );
        }
        Ok(status)
    }
}
