//! Raft log storage with state-machine snapshots.
//!
//! [`EngineStorage`] serves raft from a [`MemStorage`] and changes what
//! `snapshot` returns: the snapshot is cut at the last *applied* index and
//! carries a [`SnapshotEnvelope`] with the member address book and the
//! serialized key-value state. Leaders send it to nodes that are missing
//! the start of the log, which is how a joining node catches up.
//!
//! # On disk
//!
//! Storage opened with [`EngineStorage::open`] writes through to a data
//! directory:
//!
//! ```text
//! <data dir>/raft.log                     entries and hard state (see `wal`)
//! <data dir>/snapshots/<term>-<index>.snap  protobuf raft snapshots
//! ```
//!
//! Every entry and hard state raft hands over is synced before the Ready
//! loop moves on. [`EngineStorage::checkpoint`] writes a snapshot file and
//! drops the log prefix it covers. Reopening restores the newest snapshot
//! and replays the log after it.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use prost::Message as ProstMessage;
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::storage::{GetEntriesContext, MemStorage, RaftState, Storage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::wal::{LogFile, Replayed};
use crate::fsm::StateMachine;
use crate::snapshot::{FileSnapshotStore, MemorySink, SnapshotSink};
use crate::topology::Node;

/// Name of the log file inside a data directory.
pub const LOG_FILE: &str = "raft.log";
/// Name of the snapshot directory inside a data directory.
pub const SNAPSHOT_DIR: &str = "snapshots";

/// What travels inside a raft snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    /// Raft id to node, for every member at the snapshot index.
    pub members: BTreeMap<u64, Node>,
    /// Key-value state as written by `FsmSnapshot::persist`.
    pub state: Vec<u8>,
}

impl SnapshotEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Reads a snapshot file written by [`EngineStorage::checkpoint`].
pub fn read_snapshot_file(path: &Path) -> Result<Snapshot> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read snapshot {}", path.display()))?;
    Snapshot::decode(&bytes[..])
        .with_context(|| format!("failed to decode snapshot {}", path.display()))
}

/// Applied progress shared between the worker and the storage.
#[derive(Debug, Default)]
struct Applied {
    index: u64,
    members: BTreeMap<u64, Node>,
}

struct Durable {
    log: Mutex<LogFile>,
    snapshots: FileSnapshotStore,
}

#[derive(Clone)]
pub struct EngineStorage {
    log: MemStorage,
    fsm: StateMachine,
    applied: Arc<RwLock<Applied>>,
    durable: Option<Arc<Durable>>,
}

impl EngineStorage {
    /// Storage that lives only in memory. A restart starts from nothing.
    pub fn in_memory(fsm: StateMachine) -> Self {
        Self {
            log: MemStorage::new(),
            fsm,
            applied: Arc::new(RwLock::new(Applied::default())),
            durable: None,
        }
    }

    /// Opens storage backed by `dir`, recovering whatever an earlier run
    /// left there. At most `retain` snapshot files are kept.
    pub fn open(fsm: StateMachine, dir: &Path, retain: usize) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data dir {}", dir.display()))?;
        let snapshots = FileSnapshotStore::new(dir.join(SNAPSHOT_DIR), retain)
            .with_context(|| format!("failed to open snapshot dir in {}", dir.display()))?;
        let (log, replayed) = LogFile::open(dir.join(LOG_FILE))?;

        let latest = snapshots.latest()?;
        let storage = Self {
            durable: Some(Arc::new(Durable {
                log: Mutex::new(log),
                snapshots,
            })),
            ..Self::in_memory(fsm)
        };

        match latest {
            Some(path) => {
                let snapshot = read_snapshot_file(&path)?;
                storage.restore(snapshot)?;
                storage.replay(replayed)?;
                info!(
                    dir = %dir.display(),
                    applied = storage.applied_index(),
                    last_index = Storage::last_index(&storage)?,
                    "recovered raft state"
                );
            }
            None if !replayed.entries.is_empty() => {
                warn!(dir = %dir.display(), "raft log without a snapshot, starting empty");
            }
            None => {}
        }
        Ok(storage)
    }

    /// Whether this storage already belongs to a cluster, either from
    /// [`EngineStorage::bootstrap`] or from a previous run.
    pub fn is_initialized(&self) -> bool {
        !self.conf_state().voters.is_empty()
    }

    /// Makes `voter` the only member of a new cluster. The log starts after
    /// index 1, so any node added later is brought up to date with a
    /// snapshot.
    pub fn bootstrap(&self, voter: u64, node: Node) -> Result<()> {
        let mut initial = Snapshot::default();
        let metadata = initial.mut_metadata();
        metadata.set_index(1);
        metadata.set_term(1);
        metadata.set_conf_state(ConfState::from((vec![voter], vec![])));

        self.log
            .wl()
            .apply_snapshot(initial)
            .context("initialize bootstrap log failed")?;
        {
            let mut applied = self.applied.write();
            applied.index = 1;
            applied.members.insert(voter, node);
        }
        self.checkpoint()?;
        Ok(())
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.fsm
    }

    pub fn set_hardstate(&self, hs: HardState) -> Result<()> {
        if let Some(durable) = &self.durable {
            durable.log.lock().set_hard_state(&hs)?;
        }
        self.log.wl().set_hardstate(hs);
        Ok(())
    }

    pub fn set_commit(&self, commit: u64) -> Result<()> {
        let mut hs = self.hard_state();
        hs.commit = commit;
        self.set_hardstate(hs)
    }

    pub fn set_conf_state(&self, cs: ConfState) {
        self.log.wl().set_conf_state(cs);
    }

    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        if let Some(durable) = &self.durable {
            durable.log.lock().append(entries)?;
        }
        self.log
            .wl()
            .append(entries)
            .context("append entries failed")
    }

    /// Installs a snapshot received from the leader: the log is reset to
    /// start after it and the key-value state and members are replaced.
    pub fn install_snapshot(&self, snapshot: Snapshot) -> Result<BTreeMap<u64, Node>> {
        if let Some(durable) = &self.durable {
            write_snapshot_file(&durable.snapshots, &snapshot)?;
        }
        let members = self.restore(snapshot)?;
        self.rewrite_log()?;
        Ok(members)
    }

    fn restore(&self, snapshot: Snapshot) -> Result<BTreeMap<u64, Node>> {
        let envelope = SnapshotEnvelope::decode(&snapshot.data[..])
            .context("decode snapshot envelope failed")?;
        let index = snapshot.get_metadata().index;
        self.fsm
            .restore(envelope.state.as_slice())
            .context("restore state machine failed")?;
        self.log
            .wl()
            .apply_snapshot(snapshot)
            .context("apply snapshot failed")?;

        let mut applied = self.applied.write();
        applied.index = index;
        applied.members = envelope.members.clone();
        Ok(envelope.members)
    }

    /// Appends the entries and hard state read back from the log file on
    /// top of the restored snapshot.
    fn replay(&self, replayed: Replayed) -> Result<()> {
        let snapshot_index = Storage::first_index(&self.log)? - 1;
        let entries: Vec<Entry> = replayed
            .entries
            .into_iter()
            .filter(|entry| entry.index > snapshot_index)
            .collect();

        let mut last_index = snapshot_index;
        match entries.first() {
            Some(first) if first.index == snapshot_index + 1 => {
                last_index = snapshot_index + entries.len() as u64;
                self.log
                    .wl()
                    .append(&entries)
                    .context("replay log entries failed")?;
            }
            Some(first) => warn!(
                first = first.index,
                snapshot_index, "raft log does not continue the snapshot, ignoring it"
            ),
            None => {}
        }

        if let Some(mut hs) = replayed.hard_state {
            let current = self.hard_state();
            hs.term = hs.term.max(current.term);
            hs.commit = hs.commit.clamp(snapshot_index, last_index);
            self.log.wl().set_hardstate(hs);
        }
        debug!(snapshot_index, last_index, "raft log replayed");
        Ok(())
    }

    /// Records that everything up to `index` is applied, with `members` as
    /// the address book at that point.
    pub fn mark_applied(&self, index: u64, members: &BTreeMap<u64, Node>) {
        let mut applied = self.applied.write();
        applied.index = index;
        if applied.members != *members {
            applied.members = members.clone();
        }
    }

    pub fn applied_index(&self) -> u64 {
        self.applied.read().index
    }

    /// The address book as of the applied index.
    pub fn members(&self) -> BTreeMap<u64, Node> {
        self.applied.read().members.clone()
    }

    pub fn conf_state(&self) -> ConfState {
        self.log
            .initial_state()
            .map(|state| state.conf_state)
            .unwrap_or_default()
    }

    fn hard_state(&self) -> HardState {
        self.log
            .initial_state()
            .map(|state| state.hard_state)
            .unwrap_or_default()
    }

    /// Snapshots the applied state and drops the log entries it covers.
    /// With a data directory the snapshot is written to disk first and the
    /// log file is rewritten without those entries.
    ///
    /// Returns the index the snapshot was cut at.
    pub fn checkpoint(&self) -> Result<u64> {
        let snapshot = self.build_snapshot()?;
        let index = snapshot.get_metadata().index;
        if let Some(durable) = &self.durable {
            write_snapshot_file(&durable.snapshots, &snapshot)?;
        }
        // Keeps the entry at `index` so its term stays readable.
        self.log.wl().compact(index).context("compact log failed")?;
        self.rewrite_log()?;
        Ok(index)
    }

    /// Rewrites the log file to hold only what the in-memory log holds.
    fn rewrite_log(&self) -> Result<()> {
        let Some(durable) = &self.durable else {
            return Ok(());
        };
        let first = Storage::first_index(&self.log)?;
        let last = Storage::last_index(&self.log)?;
        let entries = if last >= first {
            self.log
                .entries(first, last + 1, None::<u64>, GetEntriesContext::empty(false))?
        } else {
            Vec::new()
        };
        durable.log.lock().rewrite(&self.hard_state(), &entries)
    }

    /// Builds a snapshot of the applied state.
    fn build_snapshot(&self) -> raft::Result<Snapshot> {
        let applied = self.applied.read();
        let mut snapshot = Snapshot::default();

        let mut sink = MemorySink::new();
        let state = self
            .fsm
            .snapshot()
            .persist(&mut sink)
            .map_err(|err| raft::Error::Store(raft::StorageError::Other(Box::new(err))))
            .and_then(|()| sink.into_bytes().map_err(raft::Error::Io))?;
        let envelope = SnapshotEnvelope {
            members: applied.members.clone(),
            state,
        };
        let data = envelope
            .encode()
            .map_err(|err| raft::Error::Store(raft::StorageError::Other(err.into())))?;
        snapshot.data = data.into();

        let term = self.log.term(applied.index)?;
        let metadata = snapshot.mut_metadata();
        metadata.set_index(applied.index);
        metadata.set_term(term);
        metadata.set_conf_state(self.conf_state());
        Ok(snapshot)
    }
}

fn write_snapshot_file(store: &FileSnapshotStore, snapshot: &Snapshot) -> Result<()> {
    let metadata = snapshot.get_metadata();
    let mut sink = store.create(metadata.term, metadata.index)?;
    let written = sink
        .write_all(&snapshot.encode_to_vec())
        .and_then(|()| sink.close());
    if let Err(err) = written {
        if let Err(cancel_err) = sink.cancel() {
            warn!(error = %cancel_err, "failed to discard snapshot file");
        }
        return Err(err).context("write snapshot file failed");
    }
    info!(
        index = metadata.index,
        term = metadata.term,
        path = %sink.path().display(),
        "snapshot written"
    );
    Ok(())
}

impl Storage for EngineStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.log.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.log.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.log.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.log.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.log.last_index()
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        if request_index > self.applied_index() {
            return Err(raft::Error::Store(
                raft::StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        self.build_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    fn entry(index: u64, term: u64, command: Command) -> Result<Entry> {
        let mut entry = Entry::default();
        entry.index = index;
        entry.term = term;
        entry.data = command.encode()?.into();
        Ok(entry)
    }

    fn bootstrapped(fsm: StateMachine, dir: &Path) -> Result<EngineStorage> {
        let storage = EngineStorage::open(fsm, dir, 2)?;
        storage.bootstrap(7, Node::new("n7", "127.0.0.1:14007"))?;
        Ok(storage)
    }

    #[test]
    fn test_envelope_carries_state_and_members() -> Result<()> {
        let fsm = StateMachine::new();
        fsm.apply(2, &Command::set("a", "1").encode()?)?;
        let storage = EngineStorage::in_memory(fsm);
        storage.bootstrap(7, Node::new("n7", "127.0.0.1:14007"))?;
        assert_eq!(Storage::first_index(&storage)?, 2);
        assert!(storage.is_initialized());

        let snapshot = Storage::snapshot(&storage, 0, 2)?;
        assert_eq!(snapshot.get_metadata().index, 1);
        assert_eq!(snapshot.get_metadata().get_conf_state().voters, vec![7]);

        let envelope = SnapshotEnvelope::decode(&snapshot.data[..])?;
        assert_eq!(envelope.members.get(&7).map(|n| n.id.as_str()), Some("n7"));

        let target = StateMachine::new();
        let joining = EngineStorage::in_memory(target.clone());
        assert!(!joining.is_initialized());
        let members = joining.install_snapshot(snapshot)?;
        assert_eq!(members.len(), 1);
        assert_eq!(joining.applied_index(), 1);
        assert_eq!(joining.conf_state().voters, vec![7]);
        assert_eq!(target.state().get("a"), Some("1".to_string()));
        Ok(())
    }

    #[test]
    fn test_snapshot_ahead_of_apply_is_unavailable() {
        let storage = EngineStorage::in_memory(StateMachine::new());
        let err = Storage::snapshot(&storage, 5, 2).unwrap_err();
        assert!(matches!(
            err,
            raft::Error::Store(raft::StorageError::SnapshotTemporarilyUnavailable)
        ));
    }

    #[test]
    fn test_reopen_recovers_log_and_hard_state() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let storage = bootstrapped(StateMachine::new(), dir.path())?;
            storage.append(&[
                entry(2, 1, Command::set("a", "1"))?,
                entry(3, 1, Command::set("b", "2"))?,
            ])?;
            let mut hs = HardState::default();
            hs.term = 1;
            hs.vote = 7;
            hs.commit = 3;
            storage.set_hardstate(hs)?;
        }

        let reopened = EngineStorage::open(StateMachine::new(), dir.path(), 2)?;
        assert!(reopened.is_initialized());
        assert_eq!(reopened.conf_state().voters, vec![7]);
        assert_eq!(reopened.applied_index(), 1);
        assert_eq!(Storage::first_index(&reopened)?, 2);
        assert_eq!(Storage::last_index(&reopened)?, 3);
        let state = Storage::initial_state(&reopened)?;
        assert_eq!(state.hard_state.commit, 3);
        assert_eq!(state.hard_state.vote, 7);
        assert_eq!(
            reopened.members().get(&7).map(|n| n.address.as_str()),
            Some("127.0.0.1:14007")
        );
        Ok(())
    }

    #[test]
    fn test_checkpoint_compacts_and_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let fsm = StateMachine::new();
            let storage = bootstrapped(fsm.clone(), dir.path())?;
            let entries = vec![
                entry(2, 1, Command::set("a", "1"))?,
                entry(3, 1, Command::set("b", "2"))?,
                entry(4, 1, Command::set("c", "3"))?,
            ];
            storage.append(&entries)?;
            for e in &entries[..2] {
                fsm.apply(e.index, &e.data[..])?;
            }
            storage.mark_applied(3, &storage.members());

            assert_eq!(storage.checkpoint()?, 3);
            assert_eq!(Storage::first_index(&storage)?, 3);
            assert_eq!(Storage::last_index(&storage)?, 4);
        }

        let fsm = StateMachine::new();
        let reopened = EngineStorage::open(fsm.clone(), dir.path(), 2)?;
        assert_eq!(reopened.applied_index(), 3);
        assert_eq!(Storage::first_index(&reopened)?, 4);
        assert_eq!(Storage::last_index(&reopened)?, 4);
        assert_eq!(fsm.state().get("a"), Some("1".to_string()));
        assert_eq!(fsm.state().get("b"), Some("2".to_string()));
        assert_eq!(fsm.state().get("c"), None);

        let snapshots = FileSnapshotStore::new(dir.path().join(SNAPSHOT_DIR), 2)?.list()?;
        assert_eq!(snapshots.len(), 2);
        Ok(())
    }

    #[test]
    fn test_installed_snapshot_is_persisted() -> Result<()> {
        let leader = EngineStorage::in_memory(StateMachine::new());
        leader.state_machine().apply(2, &Command::set("k", "v").encode()?)?;
        leader.bootstrap(7, Node::new("n7", "127.0.0.1:14007"))?;
        let snapshot = Storage::snapshot(&leader, 0, 9)?;

        let dir = tempfile::tempdir()?;
        {
            let joiner = EngineStorage::open(StateMachine::new(), dir.path(), 2)?;
            assert!(!joiner.is_initialized());
            joiner.install_snapshot(snapshot)?;
        }

        let fsm = StateMachine::new();
        let reopened = EngineStorage::open(fsm.clone(), dir.path(), 2)?;
        assert!(reopened.is_initialized());
        assert_eq!(fsm.state().get("k"), Some("v".to_string()));
        Ok(())
    }
}
