//! Durable storage for the replicated log and the vote record.
//!
//! The consensus engine is the only writer. Every term change and vote is
//! saved before the node acts on it, and entries are saved before the node
//! acknowledges them to a leader.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use dnsraft_common::error::StoreResult;
use dnsraft_common::types::{NodeId, Term};
use serde::{Deserialize, Serialize};

use super::log::LogEntry;

const STATE_FILE: &str = "raft-state.bin";
const LOG_FILE: &str = "raft-log.bin";
const FRAME_HEADER: usize = 4;

/// Term and vote, which must survive restarts to keep one vote per term.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// Everything read back from storage at startup.
#[derive(Debug, Default)]
pub struct PersistentState {
    pub hard_state: HardState,
    pub entries: Vec<LogEntry>,
}

pub trait LogStorage: Send {
    fn load(&mut self) -> StoreResult<PersistentState>;
    fn save_hard_state(&mut self, state: &HardState) -> StoreResult<()>;
    /// Appends entries after the current tail.
    fn append(&mut self, entries: &[LogEntry]) -> StoreResult<()>;
    /// Replaces the stored log, used after truncation and compaction.
    fn rewrite(&mut self, entries: &[LogEntry]) -> StoreResult<()>;
    fn close(&mut self) -> StoreResult<()>;
}

/// No-op storage for nodes running without a data directory.
#[derive(Debug, Default)]
pub struct MemoryLogStorage;

impl LogStorage for MemoryLogStorage {
    fn load(&mut self) -> StoreResult<PersistentState> {
        Ok(PersistentState::default())
    }

    fn save_hard_state(&mut self, _state: &HardState) -> StoreResult<()> {
        Ok(())
    }

    fn append(&mut self, _entries: &[LogEntry]) -> StoreResult<()> {
        Ok(())
    }

    fn rewrite(&mut self, _entries: &[LogEntry]) -> StoreResult<()> {
        Ok(())
    }

    fn close(&mut self) -> StoreResult<()> {
        Ok(())
    }
}

/// File-backed storage: a hard-state file replaced atomically and an
/// append-only log of length-prefixed bincode frames.
pub struct FileLogStorage {
    dir: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileLogStorage {
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, writer: None })
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn writer(&mut self) -> StoreResult<&mut BufWriter<File>> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => BufWriter::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.log_path())?,
            ),
        };
        Ok(self.writer.insert(writer))
    }

    fn write_frames(writer: &mut impl Write, entries: &[LogEntry]) -> StoreResult<()> {
        for entry in entries {
            let bytes = bincode::serialize(entry)?;
            writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
            writer.write_all(&bytes)?;
        }
        Ok(())
    }

    /// Reads frames until EOF. A torn trailing frame is cut off the file.
    fn read_log(path: &Path) -> StoreResult<Vec<LogEntry>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;

        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            if bytes.len() - pos < FRAME_HEADER {
                break;
            }
            let mut header = [0u8; FRAME_HEADER];
            header.copy_from_slice(&bytes[pos..pos + FRAME_HEADER]);
            let len = u32::from_le_bytes(header) as usize;
            let start = pos + FRAME_HEADER;
            if bytes.len() - start < len {
                break;
            }
            match bincode::deserialize::<LogEntry>(&bytes[start..start + len]) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    tracing::warn!(offset = pos, error = %err, "corrupt log frame");
                    break;
                }
            }
            pos = start + len;
        }

        if pos < bytes.len() {
            tracing::warn!(
                valid_bytes = pos,
                discarded = bytes.len() - pos,
                "discarding torn tail of raft log"
            );
            OpenOptions::new().write(true).open(path)?.set_len(pos as u64)?;
        }
        Ok(entries)
    }
}

impl LogStorage for FileLogStorage {
    fn load(&mut self) -> StoreResult<PersistentState> {
        let state_path = self.dir.join(STATE_FILE);
        let hard_state = if state_path.exists() {
            let mut bytes = Vec::new();
            File::open(&state_path)?.read_to_end(&mut bytes)?;
            bincode::deserialize(&bytes)?
        } else {
            HardState::default()
        };
        let entries = Self::read_log(&self.log_path())?;
        Ok(PersistentState {
            hard_state,
            entries,
        })
    }

    fn save_hard_state(&mut self, state: &HardState) -> StoreResult<()> {
        let path = self.dir.join(STATE_FILE);
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bincode::serialize(state)?)?;
            file.sync_all()?;
        }
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn append(&mut self, entries: &[LogEntry]) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let writer = self.writer()?;
        Self::write_frames(writer, entries)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    fn rewrite(&mut self, entries: &[LogEntry]) -> StoreResult<()> {
        self.writer = None;
        let path = self.log_path();
        let tmp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            Self::write_frames(&mut writer, entries)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn close(&mut self) -> StoreResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}
