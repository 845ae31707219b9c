//! Adding and replacing voters.

use tracing::info;

use crate::consensus::Consensus;
use crate::error::StoreError;
use crate::kv::Store;
use crate::topology::Node;

impl<C: Consensus> Store<C> {
    /// Makes `node_id` at `addr` a voting member.
    ///
    /// Any configured server sharing the id or the address, but not both, is
    /// removed first so a restarted node can come back under a new address (or
    /// a reused address under a new id). A server matching both already is
    /// the requested member and the call does nothing.
    ///
    /// Steps are not atomic. When a later step fails the returned error lists
    /// the entries already removed.
    pub fn join(&self, node_id: &str, addr: &str) -> Result<(), StoreError> {
        info!(node_id, addr, "received join request");
        let timeout = self.config().apply_timeout;
        let servers = self.consensus().configuration()?;

        let mut removed: Vec<Node> = Vec::new();
        for server in servers
            .iter()
            .filter(|server| server.id == node_id || server.address == addr)
        {
            if server.id == node_id && server.address == addr {
                info!(node_id, addr, "node already member of cluster, ignoring join request");
                return Ok(());
            }

            if let Err(source) = self.consensus().remove_server(&server.id, 0, timeout) {
                return Err(StoreError::RemoveExisting {
                    id: node_id.to_string(),
                    addr: addr.to_string(),
                    existing: server.node(),
                    removed,
                    source,
                });
            }
            info!(id = %server.id, address = %server.address, "removed stale cluster entry");
            removed.push(server.node());
        }

        if let Err(source) = self.consensus().add_voter(node_id, addr, 0, timeout) {
            if removed.is_empty() {
                return Err(source.into());
            }
            return Err(StoreError::AddVoter {
                id: node_id.to_string(),
                addr: addr.to_string(),
                removed,
                source,
            });
        }
        info!(node_id, addr, "node joined successfully");
        Ok(())
    }
}
