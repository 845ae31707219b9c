//! One raft replica: tikv/raft's `RawNode` plus the key-value state machine.
//!
//! [`RaftNode`] is driven from a single thread (see [`super::runtime`]). It
//! turns proposals into log entries, runs the Ready loop, applies committed
//! entries and membership changes, and installs snapshots sent by the leader.
//!
//! # The Ready loop
//!
//! Every call to [`RaftNode::poll_ready`] walks one `Ready` in the order raft
//! requires:
//!
//! 1. collect messages that may go out before anything is persisted
//! 2. install a snapshot from the leader, if one arrived
//! 3. apply committed entries to the state machine
//! 4. persist new entries and the hard state
//! 5. collect messages that needed the persisted state (votes, acks)
//! 6. advance, then apply whatever the `LightReady` committed
//!
//! Each applied entry yields an [`ApplyReport`] tagged with the
//! [`RequestId`] stored in the entry context, so the proposer can answer
//! the caller that is waiting on it.
//!
//! # Why one membership change at a time?
//!
//! Raft only accepts a configuration change once the previous one has been
//! applied. A change proposed earlier than that is turned into an empty
//! entry and its proposer never hears back. [`RaftNode::propose_membership`]
//! refuses such a change up front; the runtime queues membership requests
//! so callers never see that refusal.
//!
//! # Why pre-vote?
//!
//! A removed node, or one that rejoins under the same id, keeps campaigning
//! until it hears from the leader. With pre-vote its campaigns fail without
//! bumping the term, so the rest of the cluster keeps its leader.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use prost::Message as ProstMessage;
use raft::prelude::{ConfChange, ConfChangeType, Config, Entry, EntryType, Message, RawNode};
use raft::StateRole;
use tracing::{debug, info, warn};

use super::raft_id;
use super::silent_logger;
use super::storage::EngineStorage;
use crate::consensus::{ConsensusError, Server, Suffrage};
use crate::fsm::StateMachine;
use crate::topology::Node;

/// Identifies the proposal an entry came from: the proposing node and its
/// local request counter. Stored in the entry context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId {
    pub origin: u64,
    pub seq: u64,
}

impl RequestId {
    fn encode(self) -> Vec<u8> {
        let mut context = Vec::with_capacity(16);
        context.extend_from_slice(&self.origin.to_be_bytes());
        context.extend_from_slice(&self.seq.to_be_bytes());
        context
    }

    fn decode(context: &[u8]) -> Option<Self> {
        if context.len() != 16 {
            return None;
        }
        let (origin, seq) = context.split_at(8);
        Some(Self {
            origin: u64::from_be_bytes(origin.try_into().ok()?),
            seq: u64::from_be_bytes(seq.try_into().ok()?),
        })
    }
}

/// Outcome of one committed entry.
#[derive(Debug)]
pub struct ApplyReport {
    pub index: u64,
    pub request: Option<RequestId>,
    pub outcome: Result<(), ConsensusError>,
}

/// Output of one pass through the Ready loop.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<ApplyReport>,
}

pub struct RaftNode {
    id: u64,
    raw: RawNode<EngineStorage>,
    storage: EngineStorage,
    fsm: StateMachine,
    members: BTreeMap<u64, Node>,
    recovered: bool,
}

impl RaftNode {
    /// Creates an in-memory replica for `me`.
    ///
    /// With `bootstrap` the node starts as the only voter of a new cluster
    /// and can elect itself. Otherwise it starts empty and waits for a
    /// leader to add it and send a snapshot.
    pub fn new(me: Node, bootstrap: bool, fsm: StateMachine) -> Result<Self> {
        Self::with_storage(me, bootstrap, EngineStorage::in_memory(fsm))
    }

    /// Creates the replica for `me` over `storage`.
    ///
    /// Storage that already holds a cluster configuration (recovered from a
    /// data directory) is used as is and `bootstrap` is ignored.
    ///
    /// Timing assumes `tick` every 100ms: elections after about one second
    /// without a leader, heartbeats every 300ms.
    pub fn with_storage(me: Node, bootstrap: bool, storage: EngineStorage) -> Result<Self> {
        let id = raft_id(&me.id);
        let cfg = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            pre_vote: true,
            ..Default::default()
        };
        let recovered = storage.is_initialized();
        if recovered {
            if bootstrap {
                info!(node = %me, "existing raft state found, not bootstrapping");
            }
        } else if bootstrap {
            storage.bootstrap(id, me.clone())?;
        }
        let fsm = storage.state_machine().clone();
        let members = storage.members();
        let raw = RawNode::new(&cfg, storage.clone(), &silent_logger())
            .with_context(|| format!("failed to construct RawNode for {me}"))?;
        Ok(Self {
            id,
            raw,
            storage,
            fsm,
            members,
            recovered,
        })
    }

    /// Whether this node resumed a cluster from its data directory.
    pub fn recovered(&self) -> bool {
        self.recovered
    }

    pub fn tick(&mut self) {
        self.raw.tick();
    }

    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    pub fn is_leader(&self) -> bool {
        self.role() == StateRole::Leader
    }

    /// The current leader's raft id, or 0 if no leader is known.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn applied_index(&self) -> u64 {
        self.storage.applied_index()
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.fsm
    }

    /// The address book: every member this node has seen added.
    pub fn members(&self) -> &BTreeMap<u64, Node> {
        &self.members
    }

    /// The leader as a [`Node`]. `None` while no leader is known, and also
    /// while the leader is missing from the address book (a node that has
    /// not received its snapshot yet). An empty address would be no use to
    /// a client that wants to redirect.
    pub fn leader(&self) -> Option<Node> {
        match self.leader_id() {
            0 => None,
            id => self.members.get(&id).cloned(),
        }
    }

    /// Voters and learners of the applied configuration.
    pub fn configuration(&self) -> Vec<Server> {
        let conf = self.storage.conf_state();
        let voters = conf.voters.iter().map(|id| (id, Suffrage::Voter));
        let learners = conf.learners.iter().map(|id| (id, Suffrage::Nonvoter));
        voters
            .chain(learners)
            .map(|(&id, suffrage)| {
                let node = self.node_for(id);
                Server {
                    id: node.id,
                    address: node.address,
                    suffrage,
                }
            })
            .collect()
    }

    fn node_for(&self, id: u64) -> Node {
        self.members
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Node::new(id.to_string(), ""))
    }

    /// Appends a command to the log. Only the leader accepts proposals.
    pub fn propose(&mut self, request: RequestId, data: Vec<u8>) -> Result<(), ConsensusError> {
        if !self.is_leader() {
            return Err(ConsensusError::NotLeader);
        }
        self.raw
            .propose(request.encode(), data)
            .map_err(proposal_error)
    }

    /// Proposes a single membership change. `node` is recorded in the
    /// change so every replica learns the new member's address.
    pub fn propose_membership(
        &mut self,
        request: RequestId,
        change_type: ConfChangeType,
        node: &Node,
    ) -> Result<(), ConsensusError> {
        if !self.is_leader() {
            return Err(ConsensusError::NotLeader);
        }
        if self.has_pending_membership() {
            return Err(ConsensusError::Raft(
                "membership change in progress".to_string(),
            ));
        }
        let context =
            bincode::serialize(node).map_err(|err| ConsensusError::Raft(err.to_string()))?;
        let mut cc = ConfChange::default();
        cc.set_change_type(change_type);
        cc.node_id = raft_id(&node.id);
        cc.context = context.into();
        self.raw
            .propose_conf_change(request.encode(), cc)
            .map_err(proposal_error)
    }

    /// Whether a proposed membership change has not been applied yet. Raft
    /// drops further changes until it has.
    pub fn has_pending_membership(&self) -> bool {
        self.raw.raft.has_pending_conf()
    }

    /// Snapshots the applied state and compacts the log behind it. Returns
    /// the snapshot index.
    pub fn checkpoint(&mut self) -> Result<u64> {
        self.storage.checkpoint()
    }

    /// Feeds a message from a peer into raft.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    /// Runs one pass of the Ready loop, if raft has anything ready.
    ///
    /// Any error is fatal for this node. That includes [`crate::fsm::ApplyError`]
    /// from a committed entry this node cannot interpret.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut applied = Vec::new();
        let mut outbound = Vec::new();

        outbound.extend(ready.take_messages());

        if !ready.snapshot().is_empty() {
            self.install_snapshot(ready.snapshot().clone())?;
        }

        applied.extend(self.apply_entries(ready.take_committed_entries())?);

        if !ready.entries().is_empty() {
            self.storage.append(ready.entries())?;
        }

        if let Some(hard_state) = ready.hs() {
            self.storage.set_hardstate(hard_state.clone())?;
        }

        outbound.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.storage.set_commit(commit)?;
        }

        outbound.extend(light_ready.take_messages());
        applied.extend(self.apply_entries(light_ready.take_committed_entries())?);

        self.raw.advance_apply();

        Ok(Some(ReadyBundle {
            messages: outbound,
            applied,
        }))
    }

    fn install_snapshot(&mut self, snapshot: raft::prelude::Snapshot) -> Result<()> {
        let index = snapshot.get_metadata().index;
        self.members = self.storage.install_snapshot(snapshot)?;
        info!(
            index,
            members = self.members.len(),
            keys = self.fsm.state().len(),
            "installed snapshot from leader"
        );
        Ok(())
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<Vec<ApplyReport>> {
        let mut reports = Vec::new();
        for entry in entries {
            let index = entry.index;
            let request = RequestId::decode(&entry.context[..]);
            match entry.entry_type() {
                // Empty entries are appended by new leaders.
                EntryType::EntryNormal if entry.data.is_empty() => {}
                EntryType::EntryNormal => {
                    self.fsm.apply(index, &entry.data[..])?;
                    reports.push(ApplyReport {
                        index,
                        request,
                        outcome: Ok(()),
                    });
                }
                EntryType::EntryConfChange => {
                    let outcome = self.apply_membership(index, &entry.data[..])?;
                    reports.push(ApplyReport {
                        index,
                        request,
                        outcome,
                    });
                }
                EntryType::EntryConfChangeV2 => {
                    warn!(index, "ignoring joint consensus entry");
                }
            }
            self.storage.mark_applied(index, &self.members);
        }
        Ok(reports)
    }

    /// Applies a committed membership change. A change raft refuses is
    /// reported to the proposer; an undecodable one is fatal.
    fn apply_membership(&mut self, index: u64, data: &[u8]) -> Result<Result<(), ConsensusError>> {
        let cc = ConfChange::decode(data)
            .with_context(|| format!("decode conf change at index {index} failed"))?;
        let conf_state = match self.raw.apply_conf_change(&cc) {
            Ok(conf_state) => conf_state,
            Err(err) => {
                warn!(index, node = cc.node_id, error = %err, "membership change rejected");
                return Ok(Err(ConsensusError::Raft(err.to_string())));
            }
        };
        self.storage.set_conf_state(conf_state.clone());

        match cc.change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                if let Ok(node) = bincode::deserialize::<Node>(&cc.context[..]) {
                    info!(index, node = %node, "member added");
                    self.members.insert(cc.node_id, node);
                }
            }
            ConfChangeType::RemoveNode => {
                if let Some(node) = self.members.remove(&cc.node_id) {
                    info!(index, node = %node, "member removed");
                }
            }
        }
        debug!(index, voters = ?conf_state.voters, "configuration applied");
        Ok(Ok(()))
    }
}

fn proposal_error(err: raft::Error) -> ConsensusError {
    match err {
        raft::Error::ProposalDropped => ConsensusError::NotLeader,
        other => ConsensusError::Raft(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use std::collections::HashMap;

    /// Routes messages between nodes in memory.
    struct TestCluster {
        nodes: HashMap<u64, RaftNode>,
        seq: u64,
    }

    impl TestCluster {
        fn bootstrap(name: &str) -> Result<(Self, u64)> {
            let node = RaftNode::new(node(name), true, StateMachine::new())?;
            let id = node.id();
            let mut nodes = HashMap::new();
            nodes.insert(id, node);
            let mut cluster = Self { nodes, seq: 0 };
            cluster.node_mut(id).campaign()?;
            cluster.stabilize(10)?;
            Ok((cluster, id))
        }

        fn spawn_joiner(&mut self, name: &str) -> Result<u64> {
            let node = RaftNode::new(node(name), false, StateMachine::new())?;
            let id = node.id();
            self.nodes.insert(id, node);
            Ok(id)
        }

        fn node_mut(&mut self, id: u64) -> &mut RaftNode {
            self.nodes.get_mut(&id).expect("node not found")
        }

        fn node(&self, id: u64) -> &RaftNode {
            self.nodes.get(&id).expect("node not found")
        }

        fn next_request(&mut self, origin: u64) -> RequestId {
            self.seq += 1;
            RequestId {
                origin,
                seq: self.seq,
            }
        }

        /// Polls and routes until no node has anything ready.
        fn deliver_messages(&mut self) -> Result<Vec<ApplyReport>> {
            let mut reports = Vec::new();
            loop {
                let mut messages = Vec::new();
                let mut progressed = false;
                for node in self.nodes.values_mut() {
                    if let Some(bundle) = node.poll_ready()? {
                        progressed = true;
                        messages.extend(bundle.messages);
                        reports.extend(bundle.applied);
                    }
                }
                if !progressed {
                    break;
                }
                for msg in messages {
                    if let Some(node) = self.nodes.get_mut(&msg.to) {
                        // Responses from removed peers are refused by raft.
                        let _ = node.step(msg);
                    }
                }
            }
            Ok(reports)
        }

        /// Ticks every node `ticks` times, delivering messages in between.
        fn stabilize(&mut self, ticks: usize) -> Result<()> {
            for _ in 0..ticks {
                for node in self.nodes.values_mut() {
                    node.tick();
                }
                self.deliver_messages()?;
            }
            Ok(())
        }

        fn set(&mut self, leader: u64, key: &str, value: &str) -> Result<Vec<ApplyReport>> {
            let request = self.next_request(leader);
            let data = Command::set(key, value).encode()?;
            self.node_mut(leader).propose(request, data)?;
            self.deliver_messages()
        }

        fn add(&mut self, leader: u64, name: &str) -> Result<()> {
            let request = self.next_request(leader);
            self.node_mut(leader)
                .propose_membership(request, ConfChangeType::AddNode, &node(name))?;
            self.stabilize(20)
        }
    }

    fn node(name: &str) -> Node {
        Node::new(name, format!("{name}.local:14000"))
    }

    #[test]
    fn test_bootstrap_node_elects_itself() -> Result<()> {
        let (cluster, id) = TestCluster::bootstrap("n1")?;
        let leader = cluster.node(id);
        assert!(leader.is_leader());
        assert_eq!(leader.leader(), Some(node("n1")));
        assert_eq!(
            leader.configuration(),
            vec![Server::voter("n1", "n1.local:14000")]
        );
        Ok(())
    }

    #[test]
    fn test_committed_command_reports_request() -> Result<()> {
        let (mut cluster, id) = TestCluster::bootstrap("n1")?;
        let reports = cluster.set(id, "a", "1")?;

        let report = reports
            .iter()
            .find(|r| r.request.is_some())
            .expect("no report for proposal");
        assert_eq!(report.request, Some(RequestId { origin: id, seq: 1 }));
        assert!(report.outcome.is_ok());
        assert_eq!(
            cluster.node(id).state_machine().state().get("a"),
            Some("1".to_string())
        );
        Ok(())
    }

    #[test]
    fn test_follower_refuses_proposals() -> Result<()> {
        let (mut cluster, leader) = TestCluster::bootstrap("n1")?;
        let joiner = cluster.spawn_joiner("n2")?;
        cluster.add(leader, "n2")?;

        let request = cluster.next_request(joiner);
        let err = cluster
            .node_mut(joiner)
            .propose(request, Command::set("a", "1").encode()?)
            .unwrap_err();
        assert!(matches!(err, ConsensusError::NotLeader));
        Ok(())
    }

    #[test]
    fn test_joiner_catches_up_through_snapshot() -> Result<()> {
        let (mut cluster, leader) = TestCluster::bootstrap("n1")?;
        cluster.set(leader, "before", "join")?;

        let joiner = cluster.spawn_joiner("n2")?;
        cluster.add(leader, "n2")?;
        cluster.set(leader, "after", "join")?;

        let state = cluster.node(joiner).state_machine().state().clone();
        assert_eq!(state.get("before"), Some("join".to_string()));
        assert_eq!(state.get("after"), Some("join".to_string()));

        // The joiner learned every address from the snapshot.
        assert_eq!(cluster.node(joiner).members().len(), 2);
        assert_eq!(cluster.node(joiner).leader(), Some(node("n1")));
        assert_eq!(
            cluster.node(joiner).configuration().len(),
            cluster.node(leader).configuration().len()
        );
        Ok(())
    }

    #[test]
    fn test_remove_member() -> Result<()> {
        let (mut cluster, leader) = TestCluster::bootstrap("n1")?;
        let joiner = cluster.spawn_joiner("n2")?;
        cluster.add(leader, "n2")?;

        let request = cluster.next_request(leader);
        cluster
            .node_mut(leader)
            .propose_membership(request, ConfChangeType::RemoveNode, &node("n2"))?;
        cluster.stabilize(20)?;

        let servers = cluster.node(leader).configuration();
        assert_eq!(servers, vec![Server::voter("n1", "n1.local:14000")]);
        assert!(!cluster.node(leader).members().contains_key(&joiner));
        Ok(())
    }

    #[test]
    fn test_corrupt_entry_is_fatal() -> Result<()> {
        let (mut cluster, id) = TestCluster::bootstrap("n1")?;
        let request = cluster.next_request(id);
        cluster
            .node_mut(id)
            .propose(request, br#"{"op":"rename","key":"a"}"#.to_vec())?;

        let err = cluster.deliver_messages().err().expect("apply should fail");
        assert!(err.downcast_ref::<crate::fsm::ApplyError>().is_some());
        Ok(())
    }

    #[test]
    fn test_second_membership_change_waits_for_first() -> Result<()> {
        let (mut cluster, leader) = TestCluster::bootstrap("n1")?;
        cluster.spawn_joiner("n2")?;
        cluster.spawn_joiner("n3")?;

        let first = cluster.next_request(leader);
        cluster
            .node_mut(leader)
            .propose_membership(first, ConfChangeType::AddNode, &node("n2"))?;
        assert!(cluster.node(leader).has_pending_membership());

        let second = cluster.next_request(leader);
        let err = cluster
            .node_mut(leader)
            .propose_membership(second, ConfChangeType::AddNode, &node("n3"))
            .unwrap_err();
        assert!(matches!(err, ConsensusError::Raft(ref msg) if msg.contains("in progress")));

        cluster.stabilize(20)?;
        assert!(!cluster.node(leader).has_pending_membership());
        cluster.add(leader, "n3")?;
        assert_eq!(cluster.node(leader).configuration().len(), 3);
        Ok(())
    }

    #[test]
    fn test_leader_outside_address_book_is_unknown() -> Result<()> {
        let mut joiner = RaftNode::new(node("n2"), false, StateMachine::new())?;
        let stranger = raft_id("stranger");

        let mut heartbeat = Message::default();
        heartbeat.set_msg_type(raft::prelude::MessageType::MsgHeartbeat);
        heartbeat.from = stranger;
        heartbeat.to = joiner.id();
        heartbeat.term = 2;
        joiner.step(heartbeat)?;

        assert_eq!(joiner.leader_id(), stranger);
        assert_eq!(joiner.leader(), None);
        Ok(())
    }

    #[test]
    fn test_checkpoint_keeps_followers_in_sync() -> Result<()> {
        let (mut cluster, leader) = TestCluster::bootstrap("n1")?;
        let joiner = cluster.spawn_joiner("n2")?;
        cluster.add(leader, "n2")?;
        for i in 0..5 {
            cluster.set(leader, &format!("k{i}"), "v")?;
        }

        let index = cluster.node_mut(leader).checkpoint()?;
        assert_eq!(index, cluster.node(leader).applied_index());
        cluster.set(leader, "after", "checkpoint")?;

        let state = cluster.node(joiner).state_machine().state().clone();
        assert_eq!(state.len(), 6);
        assert_eq!(state.get("after"), Some("checkpoint".to_string()));
        Ok(())
    }

    #[test]
    fn test_request_id_context() {
        let request = RequestId { origin: 9, seq: 42 };
        assert_eq!(RequestId::decode(&request.encode()), Some(request));
        assert_eq!(RequestId::decode(b"short"), None);
    }
}
