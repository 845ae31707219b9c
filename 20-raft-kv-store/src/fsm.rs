//! The replicated state machine.
//!
//! The consensus engine drives this type through three calls:
//!
//! - [`StateMachine::apply`] for every committed entry, strictly in log order
//!   and never concurrently with itself;
//! - [`StateMachine::snapshot`] when it wants to compact or ship state;
//! - [`StateMachine::restore`] to replace the state wholesale from a snapshot.
//!
//! Apply must be deterministic: the same log yields the same map on every
//! replica. An entry this node cannot interpret is therefore fatal
//! ([`ApplyError`]); skipping it would silently fork this replica.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, trace};

use crate::command::{CodecError, Command};
use crate::snapshot::SnapshotSink;
use crate::store::StateMap;

/// An unrecoverable failure on the apply path.
///
/// Engines must stop applying and halt the node when they see one.
#[derive(Debug, Error)]
#[error("fatal: cannot apply log entry {index}: {source}")]
pub struct ApplyError {
    pub index: u64,
    #[source]
    pub source: CodecError,
}

/// Failure while persisting or restoring a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("snapshot decoding failed: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("snapshot io failed: {0}")]
    Io(#[from] io::Error),
}

/// Applies committed commands to a shared [`StateMap`].
///
/// Cloning is cheap and shares the map, so the same state can be handed to
/// the engine (for apply) and to the request path (for reads).
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    state: Arc<StateMap>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: Arc<StateMap>) -> Self {
        Self { state }
    }

    /// The map this state machine mutates.
    pub fn state(&self) -> &Arc<StateMap> {
        &self.state
    }

    /// Applies the committed entry at `index` whose payload is `data`.
    pub fn apply(&self, index: u64, data: &[u8]) -> Result<(), ApplyError> {
        let command = Command::decode(data).map_err(|source| {
            error!(index, error = %source, "undecodable committed entry");
            ApplyError { index, source }
        })?;
        trace!(index, op = command.op(), key = command.key(), "applying command");
        match command {
            Command::Set { key, value } => self.state.insert(key, value),
            Command::Delete { key } => self.state.remove(&key),
        }
        Ok(())
    }

    /// Captures the current state. The copy is taken under the map's lock,
    /// so it reflects whole applies only.
    pub fn snapshot(&self) -> FsmSnapshot {
        FsmSnapshot {
            data: self.state.snapshot(),
        }
    }

    /// Replaces the whole state with the snapshot read from `source`.
    ///
    /// The source is fully decoded before the map is touched; a malformed
    /// snapshot leaves the current state in place.
    pub fn restore<R: Read>(&self, source: R) -> Result<(), SnapshotError> {
        let data: HashMap<String, String> =
            serde_json::from_reader(source).map_err(SnapshotError::Decode)?;
        self.state.replace(data);
        Ok(())
    }
}

/// An immutable point-in-time copy of the state.
#[derive(Debug, Clone)]
pub struct FsmSnapshot {
    data: HashMap<String, String>,
}

impl FsmSnapshot {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Serializes the snapshot into `sink` and closes it.
    ///
    /// On any failure the sink is cancelled, so the engine never keeps a
    /// partial snapshot.
    pub fn persist<S: SnapshotSink + ?Sized>(&self, sink: &mut S) -> Result<(), SnapshotError> {
        let result = self.write_to(sink);
        if result.is_err() {
            if let Err(err) = sink.cancel() {
                error!(error = %err, "failed to cancel snapshot sink");
            }
        }
        result
    }

    fn write_to<S: SnapshotSink + ?Sized>(&self, sink: &mut S) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec(&self.data).map_err(SnapshotError::Encode)?;
        sink.write_all(&bytes)?;
        sink.flush()?;
        sink.close()?;
        Ok(())
    }
}
