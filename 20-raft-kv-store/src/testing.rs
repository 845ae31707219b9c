//! Testing utilities: an in-process stand-in for the consensus engine.
//!
//! [`LocalCluster`] keeps one shared log and a set of replicas, each with its
//! own [`StateMachine`]. Submitting on the leader appends to the log and,
//! unless commits are stalled, commits and applies the entry on every
//! replica before returning. This gives integration tests a whole cluster
//! without threads, sockets or timing.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::StoreConfig;
use crate::consensus::{Consensus, ConsensusError, Server};
use crate::fsm::StateMachine;
use crate::kv::Store;
use crate::snapshot::MemorySink;
use crate::store::StateMap;
use crate::topology::Node;

/// Commit timeout used by stores built from a [`LocalCluster`].
pub const TEST_APPLY_TIMEOUT: Duration = Duration::from_millis(50);

struct Replica {
    node: Node,
    fsm: StateMachine,
    applied: u64,
    halted: Option<String>,
}

impl Replica {
    fn new(node: Node) -> Self {
        Self {
            node,
            fsm: StateMachine::new(),
            applied: 0,
            halted: None,
        }
    }

    /// Applies committed entries this replica has not seen yet. Stops for
    /// good at the first fatal entry.
    fn catch_up(&mut self, log: &[Vec<u8>], commit: u64) {
        while self.halted.is_none() && self.applied < commit {
            let index = self.applied + 1;
            match self.fsm.apply(index, &log[(index - 1) as usize]) {
                Ok(()) => self.applied = index,
                Err(err) => self.halted = Some(err.to_string()),
            }
        }
    }
}

#[derive(Default)]
struct ClusterState {
    log: Vec<Vec<u8>>,
    commit: u64,
    replicas: Vec<Replica>,
    configuration: Vec<Server>,
    leader: Option<usize>,
    stalled: bool,
    unreachable: bool,
    fail_add_voter: Option<ConsensusError>,
    fail_remove: Option<ConsensusError>,
}

impl ClusterState {
    fn commit_all(&mut self) {
        self.commit = self.log.len() as u64;
        let ClusterState {
            log,
            commit,
            replicas,
            ..
        } = self;
        for replica in replicas.iter_mut() {
            replica.catch_up(log, *commit);
        }
    }

    /// Fails the way an engine does once its replica halted or went away.
    fn check_running(&self, index: usize) -> Result<(), ConsensusError> {
        if let Some(reason) = &self.replicas[index].halted {
            return Err(ConsensusError::Halted(reason.clone()));
        }
        if self.unreachable {
            return Err(ConsensusError::Shutdown);
        }
        Ok(())
    }

    fn check_leader(&self, index: usize) -> Result<(), ConsensusError> {
        self.check_running(index)?;
        if self.leader != Some(index) {
            return Err(ConsensusError::NotLeader);
        }
        Ok(())
    }
}

/// An in-memory cluster of replicas sharing one log.
///
/// Replica 0 starts as leader and every replica starts as a voter.
#[derive(Clone)]
pub struct LocalCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl LocalCluster {
    /// Creates `n` replicas named `node1..=noden` at `10.0.0.<i>:14000`.
    pub fn new(n: usize) -> Self {
        let mut state = ClusterState::default();
        for i in 1..=n {
            let node = Node::new(format!("node{i}"), format!("10.0.0.{i}:14000"));
            state
                .configuration
                .push(Server::voter(&node.id, &node.address));
            state.replicas.push(Replica::new(node));
        }
        state.leader = if n > 0 { Some(0) } else { None };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// A store for replica `index`, with [`TEST_APPLY_TIMEOUT`].
    pub fn store(&self, index: usize) -> Store<LocalConsensus> {
        let (state, address) = {
            let cluster = self.state.lock();
            let replica = &cluster.replicas[index];
            (Arc::clone(replica.fsm.state()), replica.node.address.clone())
        };
        Store::new(
            state,
            Arc::new(self.consensus(index)),
            StoreConfig::new(address).with_apply_timeout(TEST_APPLY_TIMEOUT),
        )
    }

    /// The engine handle for replica `index`.
    pub fn consensus(&self, index: usize) -> LocalConsensus {
        LocalConsensus {
            cluster: self.clone(),
            index,
        }
    }

    /// Starts a new replica that is not yet in the configuration. It is
    /// seeded from a snapshot of the leader, the way a joining node is.
    pub fn spawn_replica(&self, id: &str, address: &str) -> usize {
        let mut cluster = self.state.lock();
        let mut replica = Replica::new(Node::new(id, address));
        if let Some(leader) = cluster.leader {
            let source = &cluster.replicas[leader];
            let mut sink = MemorySink::new();
            let bytes = source
                .fsm
                .snapshot()
                .persist(&mut sink)
                .map_err(std::io::Error::other)
                .and_then(|()| sink.into_bytes());
            if let Ok(bytes) = bytes {
                if replica.fsm.restore(bytes.as_slice()).is_ok() {
                    replica.applied = source.applied;
                }
            }
        }
        let commit = cluster.commit;
        let ClusterState { log, replicas, .. } = &mut *cluster;
        replica.catch_up(log, commit);
        replicas.push(replica);
        replicas.len() - 1
    }

    pub fn state_of(&self, index: usize) -> Arc<StateMap> {
        Arc::clone(self.state.lock().replicas[index].fsm.state())
    }

    pub fn node(&self, index: usize) -> Node {
        self.state.lock().replicas[index].node.clone()
    }

    /// Moves leadership to replica `index`.
    pub fn elect(&self, index: usize) {
        self.state.lock().leader = Some(index);
    }

    /// Leaves the cluster without a known leader.
    pub fn depose(&self) {
        self.state.lock().leader = None;
    }

    /// While stalled, entries are appended but not committed and submits
    /// time out. Un-stalling commits everything appended so far.
    pub fn stall_commits(&self, stalled: bool) {
        let mut cluster = self.state.lock();
        cluster.stalled = stalled;
        if !stalled {
            cluster.commit_all();
        }
    }

    /// Makes every engine call fail as if the engine were gone.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn fail_next_add_voter(&self, err: ConsensusError) {
        self.state.lock().fail_add_voter = Some(err);
    }

    pub fn fail_next_remove(&self, err: ConsensusError) {
        self.state.lock().fail_remove = Some(err);
    }

    /// Appends and commits raw bytes, bypassing the codec. Used to feed a
    /// corrupt entry to the apply path.
    pub fn commit_raw(&self, data: Vec<u8>) {
        let mut cluster = self.state.lock();
        cluster.log.push(data);
        cluster.commit_all();
    }

    pub fn log_len(&self) -> usize {
        self.state.lock().log.len()
    }

    pub fn applied_index(&self, index: usize) -> u64 {
        self.state.lock().replicas[index].applied
    }

    pub fn is_halted(&self, index: usize) -> bool {
        self.state.lock().replicas[index].halted.is_some()
    }

    pub fn configuration(&self) -> Vec<Server> {
        self.state.lock().configuration.clone()
    }
}

/// One replica's view of a [`LocalCluster`].
#[derive(Clone)]
pub struct LocalConsensus {
    cluster: LocalCluster,
    index: usize,
}

impl Consensus for LocalConsensus {
    fn is_leader(&self) -> bool {
        self.cluster.state.lock().check_leader(self.index).is_ok()
    }

    fn leader(&self) -> Result<Option<Node>, ConsensusError> {
        let cluster = self.cluster.state.lock();
        cluster.check_running(self.index)?;
        Ok(cluster
            .leader
            .map(|leader| cluster.replicas[leader].node.clone()))
    }

    fn configuration(&self) -> Result<Vec<Server>, ConsensusError> {
        let cluster = self.cluster.state.lock();
        cluster.check_running(self.index)?;
        Ok(cluster.configuration.clone())
    }

    fn submit(&self, data: Vec<u8>, timeout: Duration) -> Result<(), ConsensusError> {
        let mut cluster = self.cluster.state.lock();
        cluster.check_leader(self.index)?;
        cluster.log.push(data);
        if cluster.stalled {
            return Err(ConsensusError::Timeout(timeout));
        }
        cluster.commit_all();
        match &cluster.replicas[self.index].halted {
            Some(reason) => Err(ConsensusError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    fn add_voter(
        &self,
        id: &str,
        address: &str,
        _prev_index: u64,
        timeout: Duration,
    ) -> Result<(), ConsensusError> {
        let mut cluster = self.cluster.state.lock();
        cluster.check_leader(self.index)?;
        if let Some(err) = cluster.fail_add_voter.take() {
            return Err(err);
        }
        if cluster.stalled {
            return Err(ConsensusError::Timeout(timeout));
        }
        match cluster.configuration.iter_mut().find(|s| s.id == id) {
            Some(existing) => existing.address = address.to_string(),
            None => cluster.configuration.push(Server::voter(id, address)),
        }
        Ok(())
    }

    fn remove_server(
        &self,
        id: &str,
        _prev_index: u64,
        timeout: Duration,
    ) -> Result<(), ConsensusError> {
        let mut cluster = self.cluster.state.lock();
        cluster.check_leader(self.index)?;
        if let Some(err) = cluster.fail_remove.take() {
            return Err(err);
        }
        if cluster.stalled {
            return Err(ConsensusError::Timeout(timeout));
        }
        cluster.configuration.retain(|s| s.id != id);
        Ok(())
    }
}
