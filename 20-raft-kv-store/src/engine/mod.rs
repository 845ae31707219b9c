//! The consensus engine, built on tikv/raft.
//!
//! - [`node`]: one replica, wrapping `RawNode` and the state machine
//! - [`runtime`]: worker thread, TCP transport and [`EngineHandle`]
//! - [`storage`]: raft log storage with state-machine snapshots, written
//!   through to a data directory when one is configured
//! - `wal`: the checksummed log file behind [`storage`]
//!
//! Cluster members are named by string ids. Raft needs numeric ids, so each
//! string id is hashed to a `u64` with [`raft_id`]. A node that joins an
//! existing cluster starts empty and is sent a snapshot by the leader once
//! it has been added as a voter. A node restarted on the same data directory
//! resumes its place in the cluster.

use std::hash::Hasher;

use slog::{o, Logger};
use twox_hash::XxHash64;

pub mod node;
pub mod runtime;
pub mod storage;
mod wal;

pub use node::RaftNode;
pub use runtime::{spawn_engine, EngineHandle, EngineStatus};

/// Maps a node id to the numeric id raft uses for it. Never 0, which raft
/// reserves for "none".
pub fn raft_id(node_id: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(node_id.as_bytes());
    hasher.finish().max(1)
}

/// tikv/raft logs through slog. Raft events this crate cares about are
/// traced by the worker instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}
