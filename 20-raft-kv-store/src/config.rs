//! Store and engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::snapshot::RETAIN_SNAPSHOT_COUNT;

/// How long a write or membership change waits for commit.
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Raft logical clock interval.
///
/// The engine ticks every 100ms, so the election timeout of 10 ticks is
/// about one second and heartbeats go out every 300ms.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Applied entries between two snapshots (and log compactions).
pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 8192;

pub const DEFAULT_HTTP_ADDR: &str = "localhost:13000";
pub const DEFAULT_RAFT_ADDR: &str = "localhost:14000";

/// Settings for the store facade.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// This node's Raft bind address, used to find itself in the
    /// membership configuration.
    pub raft_addr: String,
    /// Bound on how long `set`, `delete` and each join step wait for commit.
    pub apply_timeout: Duration,
}

impl StoreConfig {
    pub fn new(raft_addr: impl Into<String>) -> Self {
        Self {
            raft_addr: raft_addr.into(),
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
        }
    }

    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(DEFAULT_RAFT_ADDR)
    }
}

/// Settings for the tikv/raft backed engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Human-readable node id, unique in the cluster.
    pub node_id: String,
    /// Address to bind for incoming Raft messages (e.g. "127.0.0.1:14000").
    pub raft_addr: String,
    /// Start as the single voter of a new cluster instead of waiting to be
    /// added by an existing leader.
    pub bootstrap: bool,
    /// Directory holding the raft log and snapshot files. `None` keeps
    /// everything in memory, so a restarted node comes back empty.
    pub data_dir: Option<PathBuf>,
    /// Applied entries between two snapshots. 0 disables them, and with
    /// them log compaction.
    pub snapshot_threshold: u64,
    pub retain_snapshots: usize,
    pub tick_interval: Duration,
}

impl EngineConfig {
    pub fn new(node_id: impl Into<String>, raft_addr: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            raft_addr: raft_addr.into(),
            bootstrap: false,
            data_dir: None,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            retain_snapshots: RETAIN_SNAPSHOT_COUNT,
            tick_interval: TICK_INTERVAL,
        }
    }

    pub fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Set to 0 to disable snapshots.
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}
