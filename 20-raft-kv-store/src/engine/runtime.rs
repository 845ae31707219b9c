//! Worker thread and peer transport for a raft replica.
//!
//! This module owns the threading model of a running replica:
//!
//! - **Worker thread**: owns the [`RaftNode`], ticks it, runs the Ready loop
//!   and answers requests from [`EngineHandle`]
//! - **Listener thread**: accepts peer connections and hands each one to a
//!   short-lived thread that reads one message and forwards it
//! - **Peer sender threads**: one per peer address, each with its own
//!   bounded queue of outbound messages
//!
//! # Why a single worker?
//!
//! `RawNode` is not thread safe and the Ready loop has strict ordering
//! rules. Keeping every piece of mutable raft state on one thread, fed by
//! crossbeam channels, means none of it needs a lock. Callers read
//! leadership and membership from an [`EngineStatus`] the worker publishes
//! after each loop iteration, so a status query never waits on the loop.
//!
//! # Why one sender thread per peer?
//!
//! Connecting to a peer that is down, or silently dropping packets, can take
//! a long time. With one shared sender every other peer would wait behind
//! it and miss heartbeats. Each peer gets its own thread instead, connects
//! with a timeout, and drops messages once its queue is full. Raft resends
//! anything that matters.
//!
//! # Timeouts
//!
//! A request carries its deadline to the worker. When the deadline passes
//! the worker forgets the request, which drops the reply channel. The caller
//! treats that exactly like its own timer firing: the entry may still
//! commit, so the outcome is reported as [`ConsensusError::Timeout`].
//!
//! # Membership changes
//!
//! Raft takes one configuration change at a time. Requests that arrive
//! while a change is still being applied wait in a queue on the worker and
//! are proposed in order as earlier ones are applied.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::RwLock;
use prost::Message as ProstMessage;
use raft::prelude::{ConfChangeType, Message};
use raft::StateRole;
use tracing::{debug, error, info, warn};

use super::node::{ApplyReport, RaftNode, RequestId};
use super::storage::EngineStorage;
use crate::config::EngineConfig;
use crate::consensus::{Consensus, ConsensusError, Server};
use crate::fsm::StateMachine;
use crate::topology::Node;

/// Frames larger than this are refused by the listener.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Outbound messages queued for one peer before new ones are dropped.
const PEER_QUEUE_LEN: usize = 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// What the worker last reported about the node.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub role: StateRole,
    pub term: u64,
    pub leader: Option<Node>,
    pub servers: Vec<Server>,
    pub applied_index: u64,
    /// Set when the worker stopped on a fatal error.
    pub halted: Option<String>,
    /// Set when the worker exited.
    pub stopped: bool,
}

impl EngineStatus {
    fn from_node(node: &RaftNode) -> Self {
        Self {
            role: node.role(),
            term: node.term(),
            leader: node.leader(),
            servers: node.configuration(),
            applied_index: node.applied_index(),
            halted: None,
            stopped: false,
        }
    }
}

type Reply = Sender<Result<(), ConsensusError>>;

struct MembershipChange {
    seq: u64,
    change_type: ConfChangeType,
    node: Node,
    deadline: Instant,
    respond_to: Reply,
}

enum Request {
    Propose {
        seq: u64,
        data: Vec<u8>,
        deadline: Instant,
        respond_to: Reply,
    },
    ChangeMembership(MembershipChange),
    Campaign {
        respond_to: Reply,
    },
    Shutdown,
}

/// A message received from a peer, with the address it can be reached at.
struct Inbound {
    from_addr: String,
    msg: Message,
}

/// Handle to a running replica. Implements [`Consensus`] for the store.
pub struct EngineHandle {
    request_tx: Sender<Request>,
    status: Arc<RwLock<EngineStatus>>,
    local_addr: String,
    next_seq: AtomicU64,
}

impl EngineHandle {
    /// The address peers reach this node at.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn status(&self) -> EngineStatus {
        self.status.read().clone()
    }

    /// Forces an election on this node.
    pub fn campaign(&self) -> Result<(), ConsensusError> {
        self.check_running()?;
        let (respond_to, response) = bounded(1);
        self.request_tx
            .send(Request::Campaign { respond_to })
            .map_err(|_| self.stopped_error())?;
        response.recv().map_err(|_| self.stopped_error())?
    }

    /// Asks the worker to exit. Pending requests fail with
    /// [`ConsensusError::Shutdown`].
    pub fn shutdown(&self) {
        let _ = self.request_tx.send(Request::Shutdown);
    }

    fn check_running(&self) -> Result<(), ConsensusError> {
        let status = self.status.read();
        if let Some(reason) = &status.halted {
            return Err(ConsensusError::Halted(reason.clone()));
        }
        if status.stopped {
            return Err(ConsensusError::Shutdown);
        }
        Ok(())
    }

    fn stopped_error(&self) -> ConsensusError {
        match &self.status.read().halted {
            Some(reason) => ConsensusError::Halted(reason.clone()),
            None => ConsensusError::Shutdown,
        }
    }

    /// The worker dropped a reply channel. Either it exited, or it gave up
    /// on the request at its deadline just before the caller did.
    fn disconnected_error(&self, timeout: Duration) -> ConsensusError {
        let status = self.status.read();
        match &status.halted {
            Some(reason) => ConsensusError::Halted(reason.clone()),
            None if status.stopped => ConsensusError::Shutdown,
            None => ConsensusError::Timeout(timeout),
        }
    }

    /// Sends a request and waits up to `timeout` for the entry it creates to
    /// be applied.
    fn call(
        &self,
        timeout: Duration,
        build: impl FnOnce(u64, Instant, Reply) -> Request,
    ) -> Result<(), ConsensusError> {
        self.check_running()?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (respond_to, response) = bounded(1);
        self.request_tx
            .send(build(seq, Instant::now() + timeout, respond_to))
            .map_err(|_| self.stopped_error())?;
        match response.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ConsensusError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(self.disconnected_error(timeout)),
        }
    }

    fn change_membership(
        &self,
        change_type: ConfChangeType,
        node: Node,
        prev_index: u64,
        timeout: Duration,
    ) -> Result<(), ConsensusError> {
        if prev_index != 0 {
            return Err(ConsensusError::Raft(format!(
                "configuration preconditions are not supported (prev_index {prev_index})"
            )));
        }
        self.call(timeout, |seq, deadline, respond_to| {
            Request::ChangeMembership(MembershipChange {
                seq,
                change_type,
                node,
                deadline,
                respond_to,
            })
        })
    }
}

impl Consensus for EngineHandle {
    fn is_leader(&self) -> bool {
        let status = self.status.read();
        status.role == StateRole::Leader && status.halted.is_none() && !status.stopped
    }

    fn leader(&self) -> Result<Option<Node>, ConsensusError> {
        self.check_running()?;
        Ok(self.status.read().leader.clone())
    }

    fn configuration(&self) -> Result<Vec<Server>, ConsensusError> {
        self.check_running()?;
        Ok(self.status.read().servers.clone())
    }

    fn submit(&self, data: Vec<u8>, timeout: Duration) -> Result<(), ConsensusError> {
        self.call(timeout, |seq, deadline, respond_to| Request::Propose {
            seq,
            data,
            deadline,
            respond_to,
        })
    }

    fn add_voter(
        &self,
        id: &str,
        address: &str,
        prev_index: u64,
        timeout: Duration,
    ) -> Result<(), ConsensusError> {
        self.change_membership(
            ConfChangeType::AddNode,
            Node::new(id, address),
            prev_index,
            timeout,
        )
    }

    fn remove_server(
        &self,
        id: &str,
        prev_index: u64,
        timeout: Duration,
    ) -> Result<(), ConsensusError> {
        self.change_membership(
            ConfChangeType::RemoveNode,
            Node::new(id, ""),
            prev_index,
            timeout,
        )
    }
}

/// Starts a replica and returns its handle plus a channel that yields the
/// error if the worker stops on a fatal failure (such as an entry that
/// cannot be applied). Once that happens every handle call fails with
/// [`ConsensusError::Halted`].
///
/// A `raft_addr` with port 0 binds an ephemeral port, which becomes the
/// advertised address. With a data directory the replica resumes whatever
/// cluster it belonged to before; `bootstrap` then has no effect.
pub fn spawn_engine(
    config: EngineConfig,
    fsm: StateMachine,
) -> Result<(EngineHandle, Receiver<anyhow::Error>)> {
    let listener = TcpListener::bind(&config.raft_addr)
        .with_context(|| format!("failed to bind raft address {}", config.raft_addr))?;
    let local_addr = advertised_addr(&config.raft_addr, &listener)?;

    let storage = match &config.data_dir {
        Some(dir) => EngineStorage::open(fsm, dir, config.retain_snapshots)
            .with_context(|| format!("failed to open raft data in {}", dir.display()))?,
        None => EngineStorage::in_memory(fsm),
    };
    let me = Node::new(&config.node_id, &local_addr);
    let mut node = RaftNode::with_storage(me.clone(), config.bootstrap, storage)?;
    if config.bootstrap && !node.recovered() {
        node.campaign()?;
    }

    let status = Arc::new(RwLock::new(EngineStatus::from_node(&node)));
    let (request_tx, request_rx) = unbounded();
    let (network_tx, network_rx) = unbounded();
    let (fatal_tx, fatal_rx) = bounded(1);

    let listener_stop = Arc::new(AtomicBool::new(false));
    let wake = wake_addr(listener.local_addr()?);
    spawn_network_listener(listener, network_tx, Arc::clone(&listener_stop))?;

    info!(
        node = %me,
        raft_id = node.id(),
        bootstrap = config.bootstrap,
        recovered = node.recovered(),
        "raft node starting"
    );

    let worker_status = Arc::clone(&status);
    let last_snapshot_index = node.applied_index();
    let mut worker = Worker {
        node,
        routes: HashMap::new(),
        request_rx,
        network_rx,
        transport: Transport::new(local_addr.clone()),
        pending: HashMap::new(),
        membership_queue: VecDeque::new(),
        status: worker_status,
        snapshot_threshold: config.snapshot_threshold,
        last_snapshot_index,
        tick_interval: config.tick_interval,
        last_role: StateRole::Follower,
    };
    thread::Builder::new()
        .name(format!("raft-worker-{}", config.node_id))
        .spawn(move || {
            let result = worker.run();
            {
                let mut status = worker.status.write();
                status.stopped = true;
                if let Err(err) = &result {
                    status.halted = Some(format!("{err:#}"));
                }
            }
            if let Err(err) = result {
                error!(error = %format!("{err:#}"), "raft worker stopped");
                let _ = fatal_tx.send(err);
            }
            // Free the raft port for a restart.
            listener_stop.store(true, Ordering::Release);
            let _ = TcpStream::connect_timeout(&wake, CONNECT_TIMEOUT);
            // Dropping the worker fails every pending request.
            drop(worker);
        })
        .context("failed to spawn raft worker")?;

    Ok((
        EngineHandle {
            request_tx,
            status,
            local_addr,
            next_seq: AtomicU64::new(initial_seq()),
        },
        fatal_rx,
    ))
}

fn advertised_addr(requested: &str, listener: &TcpListener) -> Result<String> {
    if requested.ends_with(":0") {
        Ok(listener.local_addr()?.to_string())
    } else {
        Ok(requested.to_string())
    }
}

/// Where to connect to reach our own listener.
fn wake_addr(mut bound: SocketAddr) -> SocketAddr {
    if bound.ip().is_unspecified() {
        match bound {
            SocketAddr::V4(_) => bound.set_ip(Ipv4Addr::LOCALHOST.into()),
            SocketAddr::V6(_) => bound.set_ip(Ipv6Addr::LOCALHOST.into()),
        }
    }
    bound
}

/// Request numbers start from the clock, so entries a restarted node
/// replays from its log never match a request made after the restart.
fn initial_seq() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(1)
}

struct Pending {
    respond_to: Reply,
    deadline: Instant,
}

struct Worker {
    node: RaftNode,
    /// Addresses learned from inbound frames, for peers that are not yet
    /// in the address book.
    routes: HashMap<u64, String>,
    request_rx: Receiver<Request>,
    network_rx: Receiver<Inbound>,
    transport: Transport,
    pending: HashMap<u64, Pending>,
    /// Membership changes waiting for the one in progress to apply.
    membership_queue: VecDeque<MembershipChange>,
    status: Arc<RwLock<EngineStatus>>,
    snapshot_threshold: u64,
    last_snapshot_index: u64,
    tick_interval: Duration,
    last_role: StateRole,
}

impl Worker {
    fn run(&mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        loop {
            let timeout = self
                .tick_interval
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::from_secs(0));

            crossbeam_channel::select! {
                recv(self.request_rx) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_request(req)? {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                recv(self.network_rx) -> inbound => {
                    match inbound {
                        Ok(inbound) => self.handle_inbound(inbound),
                        Err(_) => return Err(anyhow!("network listener stopped")),
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= self.tick_interval {
                self.node.tick();
                self.expire_pending();
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.drain_membership_queue();
            self.maybe_checkpoint();
            self.publish_status();
        }
        info!(raft_id = self.node.id(), "raft worker shut down");
        Ok(())
    }

    /// Returns `false` on shutdown.
    fn handle_request(&mut self, req: Request) -> Result<bool> {
        match req {
            Request::Propose {
                seq,
                data,
                deadline,
                respond_to,
            } => {
                let request = RequestId {
                    origin: self.node.id(),
                    seq,
                };
                match self.node.propose(request, data) {
                    Ok(()) => {
                        self.pending.insert(seq, Pending { respond_to, deadline });
                    }
                    Err(err) => {
                        let _ = respond_to.send(Err(err));
                    }
                }
            }
            Request::ChangeMembership(change) => {
                if self.node.is_leader()
                    && (self.node.has_pending_membership() || !self.membership_queue.is_empty())
                {
                    debug!(node = %change.node, "membership change queued");
                    self.membership_queue.push_back(change);
                } else {
                    self.propose_membership(change);
                }
            }
            Request::Campaign { respond_to } => {
                let result = self
                    .node
                    .campaign()
                    .map_err(|err| ConsensusError::Raft(format!("{err:#}")));
                let _ = respond_to.send(result);
            }
            Request::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    fn propose_membership(&mut self, change: MembershipChange) {
        info!(change = ?change.change_type, node = %change.node, "proposing membership change");
        let request = RequestId {
            origin: self.node.id(),
            seq: change.seq,
        };
        match self
            .node
            .propose_membership(request, change.change_type, &change.node)
        {
            Ok(()) => {
                self.pending.insert(
                    change.seq,
                    Pending {
                        respond_to: change.respond_to,
                        deadline: change.deadline,
                    },
                );
            }
            Err(err) => {
                let _ = change.respond_to.send(Err(err));
            }
        }
    }

    /// Proposes queued membership changes once nothing is in progress. A
    /// node that lost leadership answers them with `NotLeader`.
    fn drain_membership_queue(&mut self) {
        while !self.node.has_pending_membership() || !self.node.is_leader() {
            let Some(change) = self.membership_queue.pop_front() else {
                return;
            };
            if change.deadline <= Instant::now() {
                continue;
            }
            self.propose_membership(change);
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let from = inbound.msg.from;
        self.routes.insert(from, inbound.from_addr);
        // Raft refuses responses from peers it no longer tracks.
        if let Err(err) = self.node.step(inbound.msg) {
            debug!(from, error = %format!("{err:#}"), "dropped raft message");
        }
    }

    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg)?;
            }
            for report in bundle.applied {
                self.notify(report);
            }
        }
        Ok(())
    }

    fn dispatch_message(&mut self, msg: Message) -> Result<()> {
        if msg.to == self.node.id() {
            return self.node.step(msg);
        }
        let to = msg.to;
        let addr = match self.node.members().get(&to) {
            Some(node) if !node.address.is_empty() => node.address.clone(),
            _ => match self.routes.get(&to) {
                Some(addr) => addr.clone(),
                None => {
                    debug!(to, "no address for peer, dropping message");
                    return Ok(());
                }
            },
        };
        self.transport.send(addr, msg)
    }

    /// Answers the caller waiting on an applied entry, if it is ours.
    fn notify(&mut self, report: ApplyReport) {
        let Some(request) = report.request else {
            return;
        };
        if request.origin != self.node.id() {
            return;
        }
        if let Some(pending) = self.pending.remove(&request.seq) {
            debug!(index = report.index, seq = request.seq, "request applied");
            let _ = pending.respond_to.send(report.outcome);
        }
    }

    /// Forgets requests whose caller has stopped waiting. Their entries may
    /// still commit.
    fn expire_pending(&mut self) {
        let now = Instant::now();
        self.pending.retain(|_, pending| pending.deadline > now);
        self.membership_queue.retain(|change| change.deadline > now);
    }

    fn maybe_checkpoint(&mut self) {
        let applied = self.node.applied_index();
        if self.snapshot_threshold == 0
            || applied < self.last_snapshot_index + self.snapshot_threshold
        {
            return;
        }
        self.last_snapshot_index = applied;

        match self.node.checkpoint() {
            Ok(index) => info!(
                index,
                keys = self.node.state_machine().state().len(),
                "checkpoint complete"
            ),
            Err(err) => warn!(index = applied, error = %format!("{err:#}"), "checkpoint failed"),
        }
    }

    fn publish_status(&mut self) {
        let role = self.node.role();
        if role != self.last_role {
            info!(
                from = ?self.last_role,
                to = ?role,
                leader = self.node.leader_id(),
                term = self.node.term(),
                "role changed"
            );
            self.last_role = role;
        }
        let mut status = self.status.write();
        *status = EngineStatus::from_node(&self.node);
    }
}

fn spawn_network_listener(
    listener: TcpListener,
    tx: Sender<Inbound>,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    thread::Builder::new()
        .name(format!("raft-net-listener-{addr}"))
        .spawn(move || {
            for stream in listener.incoming() {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        thread::spawn(move || {
                            if let Err(err) = handle_connection(stream, tx) {
                                debug!(error = %err, "raft connection error");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "raft accept error"),
                }
            }
            debug!(%addr, "raft listener closed");
        })
        .map(|_| ())
        .context("failed to spawn network listener")
}

/// Reads one frame from a peer connection and forwards it to the worker.
///
/// A frame is the sender's address then the protobuf message, each prefixed
/// by its length as a big-endian u32.
fn handle_connection(mut stream: TcpStream, tx: Sender<Inbound>) -> io::Result<()> {
    let addr = read_chunk(&mut stream)?;
    let from_addr =
        String::from_utf8(addr).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let buf = read_chunk(&mut stream)?;
    let msg =
        Message::decode(&buf[..]).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    tx.send(Inbound { from_addr, msg })
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker gone"))?;
    Ok(())
}

fn read_chunk(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Outbound side of the peer transport: a queue and a thread per address.
struct Transport {
    local_addr: String,
    peers: HashMap<String, Sender<Message>>,
}

impl Transport {
    fn new(local_addr: String) -> Self {
        Self {
            local_addr,
            peers: HashMap::new(),
        }
    }

    /// Queues `msg` for `addr`. A full queue drops the message.
    fn send(&mut self, addr: String, msg: Message) -> Result<()> {
        let queue = match self.peers.entry(addr) {
            MapEntry::Occupied(entry) => entry.into_mut(),
            MapEntry::Vacant(entry) => {
                let queue = spawn_peer_sender(self.local_addr.clone(), entry.key().clone())?;
                entry.insert(queue)
            }
        };
        match queue.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(msg)) => {
                debug!(to = msg.to, "peer queue full, dropping raft message");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(anyhow!("raft peer sender stopped")),
        }
    }
}

/// Starts the thread that writes messages to `addr`, one connection per
/// message. It exits once the [`Transport`] is dropped.
fn spawn_peer_sender(local_addr: String, addr: String) -> Result<Sender<Message>> {
    let (tx, rx) = bounded::<Message>(PEER_QUEUE_LEN);
    thread::Builder::new()
        .name(format!("raft-peer-{addr}"))
        .spawn(move || {
            // Logs each outage once.
            let mut reachable = true;
            for msg in rx {
                match try_send(&local_addr, &addr, &msg.encode_to_vec()) {
                    Ok(()) => {
                        if !reachable {
                            info!(peer = %addr, "peer reachable again");
                            reachable = true;
                        }
                    }
                    Err(err) => {
                        if reachable {
                            warn!(peer = %addr, error = %err, "failed to send raft message");
                            reachable = false;
                        }
                    }
                }
            }
        })
        .context("failed to spawn raft peer sender")?;
    Ok(tx)
}

fn try_send(local_addr: &str, addr: &str, bytes: &[u8]) -> io::Result<()> {
    let target = addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no address for {addr}"))
    })?;
    let mut stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    stream.write_all(&(local_addr.len() as u32).to_be_bytes())?;
    stream.write_all(local_addr.as_bytes())?;
    stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
    stream.write_all(bytes)?;
    Ok(())
}
