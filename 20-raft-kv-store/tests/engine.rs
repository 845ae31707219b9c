//! Integration tests for the raft engine with TCP networking on localhost.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::Receiver;
use raft_kv_store::command::Command;
use raft_kv_store::config::{EngineConfig, StoreConfig};
use raft_kv_store::consensus::{Consensus, ConsensusError};
use raft_kv_store::engine::storage::{read_snapshot_file, SnapshotEnvelope, SNAPSHOT_DIR};
use raft_kv_store::engine::{spawn_engine, EngineHandle};
use raft_kv_store::error::StoreError;
use raft_kv_store::fsm::StateMachine;
use raft_kv_store::kv::Store;
use raft_kv_store::snapshot::FileSnapshotStore;
use raft_kv_store::store::StateMap;
use raft_kv_store::topology::Node;

const TICK: Duration = Duration::from_millis(20);
const WAIT: Duration = Duration::from_secs(10);

struct TestNode {
    id: String,
    store: Store<EngineHandle>,
    fatal: Receiver<anyhow::Error>,
}

impl TestNode {
    fn spawn(id: &str, bootstrap: bool) -> Result<Self> {
        Self::spawn_with(EngineConfig::new(id, "127.0.0.1:0").with_bootstrap(bootstrap))
    }

    fn spawn_with(config: EngineConfig) -> Result<Self> {
        let id = config.node_id.clone();
        let fsm = StateMachine::new();
        let (handle, fatal) = spawn_engine(config.with_tick_interval(TICK), fsm.clone())?;
        let store_config =
            StoreConfig::new(handle.local_addr()).with_apply_timeout(Duration::from_secs(5));
        let store = Store::new(Arc::clone(fsm.state()), Arc::new(handle), store_config);
        Ok(Self { id, store, fatal })
    }

    fn addr(&self) -> &str {
        self.store.consensus().local_addr()
    }

    fn node(&self) -> Node {
        Node::new(&self.id, self.addr())
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.store.consensus().shutdown();
    }
}

/// Polls `condition` until it holds or [`WAIT`] elapses.
fn wait_for(what: &str, mut condition: impl FnMut() -> bool) -> Result<()> {
    let start = Instant::now();
    while start.elapsed() < WAIT {
        if condition() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(10));
    }
    bail!("timed out waiting for {what}")
}

fn bootstrap_leader(id: &str) -> Result<TestNode> {
    let leader = TestNode::spawn(id, true)?;
    wait_for("bootstrap leader", || leader.store.consensus().is_leader())?;
    Ok(leader)
}

#[test]
fn test_single_node_serves_writes() -> Result<()> {
    let leader = bootstrap_leader("solo")?;

    leader.store.set("a", "1")?;
    assert_eq!(leader.store.get("a"), "1");
    leader.store.delete("a")?;
    assert_eq!(leader.store.lookup("a"), None);

    let status = leader.store.status()?;
    assert_eq!(status.me, leader.node());
    assert_eq!(status.leader, leader.node());
    assert!(status.followers.is_empty());
    Ok(())
}

#[test]
fn test_joined_nodes_replicate() -> Result<()> {
    let leader = bootstrap_leader("n1")?;
    leader.store.set("before", "join")?;

    let n2 = TestNode::spawn("n2", false)?;
    let n3 = TestNode::spawn("n3", false)?;
    leader.store.join("n2", n2.addr())?;
    leader.store.join("n3", n3.addr())?;
    leader.store.set("after", "join")?;

    for node in [&n2, &n3] {
        wait_for("replication to joiner", || {
            node.store.get("before") == "join" && node.store.get("after") == "join"
        })?;
    }

    let status = leader.store.status()?;
    assert_eq!(status.leader, leader.node());
    let mut followers = status.followers.clone();
    followers.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(followers, vec![n2.node(), n3.node()]);

    wait_for("follower learns leader", || {
        n2.store
            .status()
            .map(|status| status.leader == leader.node() && status.me == n2.node())
            .unwrap_or(false)
    })?;

    let err = n3.store.set("x", "1").unwrap_err();
    assert!(matches!(err, StoreError::NotLeader));
    Ok(())
}

#[test]
fn test_unapplicable_entry_halts_node() -> Result<()> {
    let leader = bootstrap_leader("bad")?;
    leader.store.set("a", "1")?;

    let err = leader
        .store
        .consensus()
        .submit(br#"{"op":"explode","key":"a"}"#.to_vec(), Duration::from_secs(5))
        .unwrap_err();
    assert!(matches!(err, ConsensusError::Halted(_)), "got {err}");

    let fatal = leader.fatal.recv_timeout(WAIT)?;
    assert!(fatal
        .downcast_ref::<raft_kv_store::fsm::ApplyError>()
        .is_some());

    assert!(!leader.store.consensus().is_leader());
    let err = leader.store.status().unwrap_err();
    assert!(matches!(err, StoreError::Consensus(ConsensusError::Halted(_))));
    // State applied before the bad entry is still readable.
    assert_eq!(leader.store.get("a"), "1");
    Ok(())
}

#[test]
fn test_snapshots_written_to_disk() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = EngineConfig::new("snap", "127.0.0.1:0")
        .with_bootstrap(true)
        .with_data_dir(dir.path())
        .with_snapshot_threshold(5);
    let leader = TestNode::spawn_with(config)?;
    wait_for("bootstrap leader", || leader.store.consensus().is_leader())?;

    for i in 0..12 {
        leader.store.set(&format!("k{i}"), &i.to_string())?;
    }

    let snapshots = FileSnapshotStore::new(dir.path().join(SNAPSHOT_DIR), 2)?;
    let latest_index = || -> Result<u64> {
        let Some(latest) = snapshots.latest()? else {
            return Ok(0);
        };
        Ok(read_snapshot_file(&latest)?.get_metadata().index)
    };
    wait_for("snapshot past the writes", || {
        latest_index().map(|index| index >= 6).unwrap_or(false)
    })?;
    assert!(snapshots.list()?.len() <= 2);

    let Some(latest) = snapshots.latest()? else {
        bail!("no snapshot found");
    };
    let snapshot = read_snapshot_file(&latest)?;
    assert_eq!(snapshot.get_metadata().get_conf_state().voters.len(), 1);
    let envelope = SnapshotEnvelope::decode(&snapshot.data[..])?;
    let restored = StateMachine::new();
    restored.restore(envelope.state.as_slice())?;
    assert_eq!(restored.state().get("k0"), Some("0".to_string()));
    assert_eq!(envelope.members.len(), 1);
    Ok(())
}

#[test]
fn test_restarted_node_recovers_its_data() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = |addr: &str| {
        EngineConfig::new("durable", addr)
            .with_bootstrap(true)
            .with_data_dir(dir.path())
            .with_snapshot_threshold(4)
    };

    let first = TestNode::spawn_with(config("127.0.0.1:0"))?;
    wait_for("bootstrap leader", || first.store.consensus().is_leader())?;
    for i in 0..10 {
        first.store.set(&format!("k{i}"), &i.to_string())?;
    }
    let addr = first.addr().to_string();
    let engine = Arc::clone(first.store.consensus());
    drop(first);
    wait_for("first run stopped", || engine.status().stopped)?;

    let mut restarted = None;
    wait_for("restart on the same address", || {
        if restarted.is_none() {
            restarted = TestNode::spawn_with(config(&addr)).ok();
        }
        restarted.is_some()
    })?;
    let Some(node) = restarted else {
        bail!("node did not restart");
    };

    wait_for("leader after restart", || node.store.consensus().is_leader())?;
    wait_for("state replayed", || {
        (0..10).all(|i| node.store.get(&format!("k{i}")) == i.to_string())
    })?;
    node.store.set("after", "restart")?;
    assert_eq!(node.store.get("after"), "restart");

    let status = node.store.status()?;
    assert_eq!(status.me, node.node());
    assert_eq!(status.leader, node.node());
    assert_eq!(node.store.consensus().configuration()?.len(), 1);
    Ok(())
}

#[test]
fn test_rejoin_at_new_address() -> Result<()> {
    let leader = bootstrap_leader("r1")?;
    let old = TestNode::spawn("r2", false)?;
    leader.store.join("r2", old.addr())?;
    leader.store.set("k", "v")?;
    wait_for("first replica catches up", || old.store.get("k") == "v")?;

    let moved = TestNode::spawn("r2", false)?;
    leader.store.join("r2", moved.addr())?;
    drop(old);

    let servers = leader.store.consensus().configuration()?;
    let entries: Vec<_> = servers.iter().filter(|server| server.id == "r2").collect();
    assert_eq!(entries.len(), 1, "configuration: {servers:?}");
    assert_eq!(entries[0].address, moved.addr());

    leader.store.set("after", "rejoin")?;
    wait_for("moved replica catches up", || {
        moved.store.get("k") == "v" && moved.store.get("after") == "rejoin"
    })?;
    Ok(())
}

#[test]
fn test_stalled_write_reports_commit_timeout() -> Result<()> {
    let leader = bootstrap_leader("t1")?;
    let follower = TestNode::spawn("t2", false)?;
    leader.store.join("t2", follower.addr())?;
    // Without its only peer the leader can no longer commit.
    drop(follower);

    let timeout = Duration::from_millis(300);
    let impatient = Store::new(
        Arc::new(StateMap::new()),
        Arc::clone(leader.store.consensus()),
        StoreConfig::new(leader.addr()).with_apply_timeout(timeout),
    );
    for i in 0..5 {
        let err = impatient.set(&format!("k{i}"), "v").unwrap_err();
        assert!(
            matches!(err, StoreError::CommitTimeout(t) if t == timeout),
            "write {i}: {err}"
        );
    }
    assert!(leader.store.consensus().is_leader());
    Ok(())
}

#[test]
fn test_concurrent_joins_both_succeed() -> Result<()> {
    let leader = bootstrap_leader("c1")?;
    let a = TestNode::spawn("ca", false)?;
    let b = TestNode::spawn("cb", false)?;

    let (joined_a, joined_b) = thread::scope(|scope| {
        let join_a = scope.spawn(|| leader.store.join("ca", a.addr()));
        let join_b = scope.spawn(|| leader.store.join("cb", b.addr()));
        (join_a.join(), join_b.join())
    });
    joined_a.map_err(|_| anyhow!("join thread panicked"))??;
    joined_b.map_err(|_| anyhow!("join thread panicked"))??;

    let mut ids: Vec<String> = leader
        .store
        .consensus()
        .configuration()?
        .into_iter()
        .map(|server| server.id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["c1", "ca", "cb"]);

    leader.store.set("k", "v")?;
    for node in [&a, &b] {
        wait_for("joiner catches up", || node.store.get("k") == "v")?;
    }
    Ok(())
}

#[test]
fn test_commands_bypassing_store_still_apply() -> Result<()> {
    let leader = bootstrap_leader("raw")?;
    let data = Command::set("raw", "entry").encode()?;
    leader
        .store
        .consensus()
        .submit(data, Duration::from_secs(5))?;
    assert_eq!(leader.store.get("raw"), "entry");
    Ok(())
}
