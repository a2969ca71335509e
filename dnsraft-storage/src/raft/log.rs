use dnsraft_common::error::StoreResult;
use dnsraft_common::types::{LogIndex, Term};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A single log entry in the Raft log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,               // Term number when entry was received by leader
    pub index: LogIndex,          // Index of the log entry in the log
    pub entry_type: LogEntryType, // Type of entry (Command/Configuration/Noop)
    pub data: Vec<u8>,            // Payload, bincode encoded
}

/// Type of log entry; decides how the node interprets the payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogEntryType {
    Command,       // Store mutation applied to the state machine
    Configuration, // Full cluster membership after a change
    Noop,          // Empty entry to assert leadership
}

impl LogEntry {
    pub fn new<T: Serialize>(
        term: Term,
        index: LogIndex,
        entry_type: LogEntryType,
        payload: &T,
    ) -> StoreResult<Self> {
        Ok(Self {
            term,
            index,
            entry_type,
            data: bincode::serialize(payload)?,
        })
    }

    pub fn noop(term: Term, index: LogIndex) -> Self {
        Self {
            term,
            index,
            entry_type: LogEntryType::Noop,
            data: Vec::new(),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> StoreResult<T> {
        Ok(bincode::deserialize(&self.data)?)
    }
}

/// The in-memory view of one node's log.
///
/// Entries up to `snapshot_index` have been compacted into a snapshot; the
/// remaining entries are contiguous, so `entries[i].index == snapshot_index + 1 + i`.
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    snapshot_index: LogIndex,
    snapshot_term: Term,
}

impl RaftLog {
    /// Create an empty Raft log
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from a snapshot base and the entries persisted after it.
    /// Entries at or below the base are skipped.
    pub fn restore(snapshot_index: LogIndex, snapshot_term: Term, entries: Vec<LogEntry>) -> Self {
        let mut log = Self {
            entries: Vec::with_capacity(entries.len()),
            snapshot_index,
            snapshot_term,
        };
        for entry in entries {
            if entry.index <= log.last_index() {
                continue;
            }
            if entry.index != log.last_index() + 1 {
                tracing::warn!(
                    expected = log.last_index() + 1,
                    found = entry.index,
                    "gap in persisted log; dropping the tail"
                );
                break;
            }
            log.entries.push(entry);
        }
        log
    }

    /// Append a new log entry to the log
    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Get a specific log entry by Raft log index. Compacted entries are gone.
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Term of the entry at `index`, including the compacted boundary entry.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Returns the last log index, or the snapshot index if no entries follow it
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    /// Returns the term of the last entry
    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    /// Entries still held in memory (everything after the snapshot base).
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Up to `max` entries starting at `start`.
    pub fn entries_from(&self, start: LogIndex, max: usize) -> Vec<LogEntry> {
        if start <= self.snapshot_index {
            return Vec::new();
        }
        let offset = (start - self.snapshot_index - 1) as usize;
        self.entries.iter().skip(offset).take(max).cloned().collect()
    }

    /// Drop every entry with index >= `index`. Returns true if anything was removed.
    pub fn truncate_from(&mut self, index: LogIndex) -> bool {
        if index <= self.snapshot_index || index > self.last_index() {
            return false;
        }
        let keep = (index - self.snapshot_index - 1) as usize;
        self.entries.truncate(keep);
        true
    }

    /// Discard entries up to and including `index`, which becomes the new base.
    pub fn compact_to(&mut self, index: LogIndex, term: Term) {
        if index <= self.snapshot_index {
            return;
        }
        let drop = ((index - self.snapshot_index) as usize).min(self.entries.len());
        self.entries.drain(..drop);
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Replace the whole log with an empty one based at a snapshot.
    pub fn reset_to_snapshot(&mut self, index: LogIndex, term: Term) {
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Raft's "at least as up-to-date" comparison against a candidate's log.
    pub fn is_up_to_date(&self, last_index: LogIndex, last_term: Term) -> bool {
        last_term > self.last_term() || (last_term == self.last_term() && last_index >= self.last_index())
    }

    /// First in-memory index holding an entry of `term`, used to skip a
    /// whole conflicting term when backing off.
    pub fn first_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries.iter().find(|e| e.term == term).map(|e| e.index)
    }
}
