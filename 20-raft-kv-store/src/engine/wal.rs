//! Append-only file holding the raft log entries and hard state.
//!
//! Every record is written as
//!
//! ```text
//! [tag: u8][len: u32 LE][payload: len bytes][checksum: u64 LE]
//! ```
//!
//! where the payload is the protobuf encoding of an [`Entry`] or a
//! [`HardState`] and the checksum is XxHash64 over tag and payload. Records
//! are only ever appended; a later entry at an index already in the file
//! replaces it and everything after it, exactly as raft truncates a
//! conflicting suffix.
//!
//! # Why checksums?
//!
//! A crash in the middle of a write leaves a torn record at the end of the
//! file. On open the file is read up to the first record that is short or
//! fails its checksum, and everything from there on is cut off. Raft only
//! counts an entry as persisted once the write returned, so nothing that
//! was acknowledged is lost.
//!
//! # Compaction
//!
//! Once a snapshot covers a prefix of the log, [`LogFile::rewrite`] replaces
//! the file with one holding only the hard state and the entries after the
//! snapshot. The new file is written next to the old one and renamed over it.

use std::fs::{self, File, OpenOptions};
use std::hash::Hasher;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use prost::Message as ProstMessage;
use raft::prelude::{Entry, HardState};
use tracing::{debug, warn};
use twox_hash::XxHash64;

const TAG_ENTRY: u8 = 1;
const TAG_HARD_STATE: u8 = 2;

const HEADER_LEN: usize = 5;
const CHECKSUM_LEN: usize = 8;

/// Records larger than this are treated as corruption.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// What the file held when it was opened.
#[derive(Debug, Default)]
pub struct Replayed {
    /// The last hard state written, if any.
    pub hard_state: Option<HardState>,
    /// A contiguous run of entries, conflicts already resolved.
    pub entries: Vec<Entry>,
}

impl Replayed {
    /// Adds `entry` the way an append does: it replaces the entry at its
    /// index and drops everything after.
    fn push(&mut self, entry: Entry) {
        let Some(first) = self.entries.first().map(|e| e.index) else {
            self.entries.push(entry);
            return;
        };
        let last = first + self.entries.len() as u64 - 1;
        if entry.index < first || entry.index > last + 1 {
            // Only a rewrite or an installed snapshot moves the start.
            self.entries.clear();
        } else {
            self.entries.truncate((entry.index - first) as usize);
        }
        self.entries.push(entry);
    }
}

pub struct LogFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl LogFile {
    /// Opens (or creates) the log at `path` and replays what it holds.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, Replayed)> {
        let path = path.into();
        let (replayed, valid_len) = if path.exists() {
            read_records(&path)?
        } else {
            (Replayed::default(), 0)
        };

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open raft log {}", path.display()))?;
        let len = file.metadata()?.len();
        if len > valid_len {
            warn!(
                path = %path.display(),
                dropped = len - valid_len,
                "discarding torn tail of raft log"
            );
            file.set_len(valid_len)?;
        }
        file.seek(SeekFrom::End(0))?;

        debug!(
            path = %path.display(),
            entries = replayed.entries.len(),
            "raft log opened"
        );
        Ok((
            Self {
                path,
                writer: BufWriter::new(file),
            },
            replayed,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `entries` and syncs them to disk.
    pub fn append(&mut self, entries: &[Entry]) -> Result<()> {
        for entry in entries {
            write_record(&mut self.writer, TAG_ENTRY, &entry.encode_to_vec())?;
        }
        self.sync()
    }

    /// Records `hard_state` and syncs it to disk.
    pub fn set_hard_state(&mut self, hard_state: &HardState) -> Result<()> {
        write_record(&mut self.writer, TAG_HARD_STATE, &hard_state.encode_to_vec())?;
        self.sync()
    }

    /// Replaces the whole file with `hard_state` followed by `entries`.
    pub fn rewrite(&mut self, hard_state: &HardState, entries: &[Entry]) -> Result<()> {
        let tmp_path = self.path.with_extension("rewrite");
        {
            let mut out = BufWriter::new(File::create(&tmp_path)?);
            write_record(&mut out, TAG_HARD_STATE, &hard_state.encode_to_vec())?;
            for entry in entries {
                write_record(&mut out, TAG_ENTRY, &entry.encode_to_vec())?;
            }
            let file = out.into_inner().map_err(|err| err.into_error())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to replace raft log {}", self.path.display()))?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        debug!(entries = entries.len(), "raft log rewritten");
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

fn checksum(tag: u8, payload: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write_u8(tag);
    hasher.write(payload);
    hasher.finish()
}

fn write_record<W: Write>(out: &mut W, tag: u8, payload: &[u8]) -> io::Result<()> {
    out.write_all(&[tag])?;
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(payload)?;
    out.write_all(&checksum(tag, payload).to_le_bytes())
}

/// Reads records until the end of the file or the first damaged one.
/// Returns what was read and the length of the intact prefix.
fn read_records(path: &Path) -> Result<(Replayed, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut replayed = Replayed::default();
    let mut valid_len = 0u64;

    loop {
        let mut header = [0u8; HEADER_LEN];
        if !read_full(&mut reader, &mut header)? {
            break;
        }
        let tag = header[0];
        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len > MAX_RECORD_LEN {
            warn!(len, "raft log record too large, treating as torn");
            break;
        }
        let mut payload = vec![0u8; len];
        let mut sum = [0u8; CHECKSUM_LEN];
        if !read_full(&mut reader, &mut payload)? || !read_full(&mut reader, &mut sum)? {
            break;
        }
        if checksum(tag, &payload) != u64::from_le_bytes(sum) {
            warn!(offset = valid_len, "raft log checksum mismatch, treating as torn");
            break;
        }

        match tag {
            TAG_ENTRY => replayed.push(Entry::decode(&payload[..]).context("decode log entry")?),
            TAG_HARD_STATE => {
                replayed.hard_state =
                    Some(HardState::decode(&payload[..]).context("decode hard state")?)
            }
            other => bail!("unknown raft log record tag {other}"),
        }
        valid_len += (HEADER_LEN + len + CHECKSUM_LEN) as u64;
    }
    Ok((replayed, valid_len))
}

/// Fills `buf`, returning `false` if the file ends first.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err),
    }
}
