use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use concord_common::error::{ConcordError, Result};
use concord_common::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::durable::{read_optional, write_atomic};

/// A single log entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,        // Term number when entry was received by leader
    pub index: LogIndex,   // Index of the log entry in the log
    pub command: Vec<u8>,  // Opaque payload for the state machine
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: Vec<u8>) -> Self {
        Self {
            term,
            index,
            command,
        }
    }
}

/// The replicated log of one node.
///
/// Entries are gap-free starting at `snapshot_index + 1`; everything at or
/// below `snapshot_index` has been folded into a snapshot. When backed by a
/// file, every mutation reaches disk before the call returns.
#[derive(Debug)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    snapshot_index: LogIndex,
    snapshot_term: Term,
    file: Option<LogFile>,
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftLog {
    /// Create an empty, memory-only Raft log
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            snapshot_index: 0,
            snapshot_term: 0,
            file: None,
        }
    }

    /// Opens (or creates) a file-backed log and loads whatever survived.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let (file, boundary, entries) = LogFile::open(path.into())?;
        debug!(
            path = %file.path.display(),
            snapshot_index = boundary.snapshot_index,
            entries = entries.len(),
            "loaded raft log"
        );
        Ok(Self {
            entries,
            snapshot_index: boundary.snapshot_index,
            snapshot_term: boundary.snapshot_term,
            file: Some(file),
        })
    }

    /// Index of the oldest retained entry (one past the snapshot boundary)
    pub fn first_index(&self) -> LogIndex {
        self.snapshot_index + 1
    }

    /// Returns the last log index, or the snapshot boundary if nothing is retained
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    /// Returns the term of the last entry, or the snapshot's term
    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    /// Number of retained (uncompacted) entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get a specific log entry by Raft log index
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Term of the entry at `index`. Known for retained entries and for the
    /// snapshot boundary itself (index 0 has term 0).
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Up to `max` entries starting at `start`.
    pub fn entries_from(&self, start: LogIndex, max: usize) -> Vec<LogEntry> {
        let start = start.max(self.first_index());
        if start > self.last_index() {
            return Vec::new();
        }
        let offset = (start - self.snapshot_index - 1) as usize;
        self.entries[offset..].iter().take(max).cloned().collect()
    }

    /// Lowest retained index holding `term`, scanning back from `from`.
    pub fn first_index_of_term(&self, term: Term, from: LogIndex) -> LogIndex {
        let mut index = from;
        while index > self.first_index() && self.term_at(index - 1) == Some(term) {
            index -= 1;
        }
        index
    }

    /// Highest retained index holding `term`, if any.
    pub fn last_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    /// Appends entries strictly after the current last index.
    ///
    /// Fails with [`ConcordError::LogGap`] if the first entry would not be
    /// contiguous with the log, or if the batch itself skips an index.
    pub fn append(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        let mut expected = self.last_index() + 1;
        for entry in &entries {
            if entry.index != expected {
                return Err(ConcordError::LogGap {
                    expected,
                    got: entry.index,
                });
            }
            expected += 1;
        }
        if entries.is_empty() {
            return Ok(());
        }

        if let Some(file) = &mut self.file {
            file.append(&entries)?;
        }
        self.entries.extend(entries);
        Ok(())
    }

    /// Appends one command at the next index, returning that index.
    pub fn append_command(&mut self, term: Term, command: Vec<u8>) -> Result<LogIndex> {
        let index = self.last_index() + 1;
        self.append(vec![LogEntry::new(term, index, command)])?;
        Ok(index)
    }

    /// Removes `index` and everything after it. Only the retained suffix can
    /// be truncated; compacted entries are committed and immutable.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        if index <= self.snapshot_index {
            return Err(ConcordError::Consensus(format!(
                "cannot truncate at {index}: compacted through {}",
                self.snapshot_index
            )));
        }
        if index > self.last_index() {
            return Ok(());
        }

        let keep = (index - self.snapshot_index - 1) as usize;
        let boundary = self.boundary();
        if let Some(file) = &self.file {
            file.rewrite(boundary, &self.entries[..keep])?;
        }
        self.entries.truncate(keep);
        Ok(())
    }

    /// Discards entries up to and including `index`, which the caller has
    /// captured in a durable snapshot with the given term.
    pub fn compact_to(&mut self, index: LogIndex, term: Term) -> Result<()> {
        if index <= self.snapshot_index {
            return Ok(());
        }

        let discard = ((index - self.snapshot_index) as usize).min(self.entries.len());
        let boundary = Boundary {
            snapshot_index: index,
            snapshot_term: term,
        };
        if let Some(file) = &self.file {
            file.rewrite(boundary, &self.entries[discard..])?;
        }
        self.entries.drain(..discard);
        self.snapshot_index = index;
        self.snapshot_term = term;
        Ok(())
    }

    /// Throws away the whole log and restarts it right after a snapshot
    /// received from the leader.
    pub fn reset_to_snapshot(&mut self, index: LogIndex, term: Term) -> Result<()> {
        let boundary = Boundary {
            snapshot_index: index,
            snapshot_term: term,
        };
        if let Some(file) = &self.file {
            file.rewrite(boundary, &[])?;
        }
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
        Ok(())
    }

    fn boundary(&self) -> Boundary {
        Boundary {
            snapshot_index: self.snapshot_index,
            snapshot_term: self.snapshot_term,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Boundary {
    snapshot_index: LogIndex,
    snapshot_term: Term,
}

const HEADER_LEN: usize = 16;

/// On-disk layout: a 16-byte header (snapshot index and term, big endian)
/// followed by `[u32 length][bincode entry]` records.
#[derive(Debug)]
struct LogFile {
    path: PathBuf,
}

impl LogFile {
    fn open(path: PathBuf) -> Result<(Self, Boundary, Vec<LogEntry>)> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = LogFile { path };

        let Some(bytes) = read_optional(&file.path)? else {
            file.rewrite(Boundary::default(), &[])?;
            return Ok((file, Boundary::default(), Vec::new()));
        };

        let (boundary, entries, clean) = decode(&bytes);
        if !clean {
            warn!(path = %file.path.display(), kept = entries.len(), "dropping torn tail of raft log");
            file.rewrite(boundary, &entries)?;
        }
        Ok((file, boundary, entries))
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        let mut buf = BytesMut::new();
        for entry in entries {
            encode_record(&mut buf, entry)?;
        }

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| ConcordError::persistence("open log for append", e))?;
        file.write_all(&buf)
            .and_then(|_| file.sync_data())
            .map_err(|e| ConcordError::persistence("append to log", e))
    }

    fn rewrite(&self, boundary: Boundary, entries: &[LogEntry]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_u64(boundary.snapshot_index);
        buf.put_u64(boundary.snapshot_term);
        for entry in entries {
            encode_record(&mut buf, entry)?;
        }
        write_atomic(&self.path, &buf).map_err(|e| ConcordError::persistence("rewrite log", e))
    }
}

fn encode_record(buf: &mut BytesMut, entry: &LogEntry) -> Result<()> {
    let payload = bincode::serialize(entry)?;
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(())
}

/// Decodes as many whole records as possible. The flag is false when
/// trailing bytes had to be dropped.
fn decode(bytes: &[u8]) -> (Boundary, Vec<LogEntry>, bool) {
    let mut cursor = bytes;
    if cursor.remaining() < HEADER_LEN {
        return (Boundary::default(), Vec::new(), cursor.is_empty());
    }
    let boundary = Boundary {
        snapshot_index: cursor.get_u64(),
        snapshot_term: cursor.get_u64(),
    };

    let mut entries: Vec<LogEntry> = Vec::new();
    while cursor.remaining() >= 4 {
        let len = cursor.get_u32() as usize;
        if cursor.remaining() < len {
            return (boundary, entries, false);
        }
        match bincode::deserialize::<LogEntry>(&cursor[..len]) {
            Ok(entry) => entries.push(entry),
            Err(_) => return (boundary, entries, false),
        }
        cursor.advance(len);
    }
    (boundary, entries, !cursor.has_remaining())
}

/// Path of the log file inside a node's data directory.
pub fn log_path(dir: &Path) -> PathBuf {
    dir.join("raft.log")
}
