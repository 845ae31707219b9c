//! Destinations for persisted state machine snapshots.
//!
//! A [`SnapshotSink`] is handed to [`crate::fsm::FsmSnapshot::persist`]. The
//! snapshot writes its bytes and then either closes the sink (the snapshot is
//! complete) or cancels it (nothing partial may be left behind).

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Number of snapshot files kept on disk by default.
pub const RETAIN_SNAPSHOT_COUNT: usize = 2;

const SNAPSHOT_EXT: &str = "snap";
const TMP_EXT: &str = "tmp";

/// Write side of a snapshot, provided by the consensus engine.
pub trait SnapshotSink: Write {
    /// Marks the snapshot complete. No writes may follow.
    fn close(&mut self) -> io::Result<()>;

    /// Abandons the snapshot and discards everything written so far.
    fn cancel(&mut self) -> io::Result<()>;
}

/// A sink that collects the snapshot in memory.
///
/// The raft engine uses this to build the payload it ships to lagging or
/// joining followers.
#[derive(Debug, Default)]
pub struct MemorySink {
    buf: Vec<u8>,
    closed: bool,
    cancelled: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Returns the bytes of a closed snapshot.
    pub fn into_bytes(self) -> io::Result<Vec<u8>> {
        if self.closed {
            Ok(self.buf)
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                "snapshot sink was not closed",
            ))
        }
    }
}

impl Write for MemorySink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.closed || self.cancelled {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "snapshot sink is finished",
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SnapshotSink for MemorySink {
    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }

    fn cancel(&mut self) -> io::Result<()> {
        self.cancelled = true;
        self.buf.clear();
        Ok(())
    }
}

/// Directory of snapshot files, keeping only the newest `retain` of them.
///
/// Files are named `<term>-<index>.snap` with zero-padded numbers so that
/// lexical order is snapshot order. A sink writes to a `.tmp` file and only
/// renames it into place on close.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, retain: usize) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retain: retain.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Opens a sink for a snapshot covering the log up to `index` in `term`.
    pub fn create(&self, term: u64, index: u64) -> io::Result<FileSnapshotSink> {
        let name = format!("{term:020}-{index:020}");
        let final_path = self.dir.join(format!("{name}.{SNAPSHOT_EXT}"));
        let tmp_path = self.dir.join(format!("{name}.{TMP_EXT}"));
        let file = File::create(&tmp_path)?;
        Ok(FileSnapshotSink {
            writer: Some(BufWriter::new(file)),
            tmp_path,
            final_path,
            store: self.clone(),
        })
    }

    /// Completed snapshot files, oldest first.
    pub fn list(&self) -> io::Result<Vec<PathBuf>> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(SNAPSHOT_EXT) {
                snapshots.push(path);
            }
        }
        snapshots.sort();
        Ok(snapshots)
    }

    /// The newest completed snapshot, if any.
    pub fn latest(&self) -> io::Result<Option<PathBuf>> {
        Ok(self.list()?.pop())
    }

    fn reap(&self) -> io::Result<()> {
        let snapshots = self.list()?;
        let excess = snapshots.len().saturating_sub(self.retain);
        for path in &snapshots[..excess] {
            debug!(path = %path.display(), "reaping old snapshot");
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Sink for one snapshot file. Dropping it without closing cancels it.
pub struct FileSnapshotSink {
    writer: Option<BufWriter<File>>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    store: FileSnapshotStore,
}

impl FileSnapshotSink {
    pub fn path(&self) -> &Path {
        &self.final_path
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "snapshot sink is finished")
        })
    }
}

impl Write for FileSnapshotSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.writer()?.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn close(&mut self) -> io::Result<()> {
        let writer = self.writer.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "snapshot sink is finished")
        })?;
        let published = writer
            .into_inner()
            .map_err(|err| err.into_error())
            .and_then(|file| file.sync_all())
            .and_then(|()| fs::rename(&self.tmp_path, &self.final_path));
        if let Err(err) = published {
            if let Err(remove_err) = fs::remove_file(&self.tmp_path) {
                warn!(path = %self.tmp_path.display(), error = %remove_err, "failed to discard unpublished snapshot");
            }
            return Err(err);
        }
        self.store.reap()
    }

    fn cancel(&mut self) -> io::Result<()> {
        if self.writer.take().is_some() {
            fs::remove_file(&self.tmp_path)?;
        }
        Ok(())
    }
}

impl Drop for FileSnapshotSink {
    fn drop(&mut self) {
        if self.writer.is_some() {
            if let Err(err) = self.cancel() {
                warn!(path = %self.tmp_path.display(), error = %err, "failed to discard unfinished snapshot");
            }
        }
    }
}
