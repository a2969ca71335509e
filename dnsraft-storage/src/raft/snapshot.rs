use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;

use dnsraft_common::error::StoreResult;
use dnsraft_common::types::{ClusterMembership, LogIndex, Term};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RaftSnapshot {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    /// Cluster configuration in effect at `last_included_index`.
    pub membership: ClusterMembership,
    pub state: Vec<u8>, // Serialized state machine data
}

/// Defines the behavior for any snapshot storage backend.
pub trait SnapshotStorage: Send {
    fn save(&self, snapshot: &RaftSnapshot) -> StoreResult<()>;
    fn load(&self) -> StoreResult<Option<RaftSnapshot>>;
}

/// Saves snapshots as a binary file.
///
/// The file is written next to its final path and renamed into place, so a
/// crash mid-save leaves the previous snapshot intact.
pub struct FileSnapshotStorage {
    pub path: PathBuf,
}

impl FileSnapshotStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotStorage for FileSnapshotStorage {
    fn save(&self, snapshot: &RaftSnapshot) -> StoreResult<()> {
        let encoded = bincode::serialize(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn load(&self) -> StoreResult<Option<RaftSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&self.path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let snapshot = bincode::deserialize(&bytes)?;
        Ok(Some(snapshot))
    }
}

/// Keeps the latest snapshot in memory when persistence is disabled.
#[derive(Default)]
pub struct MemorySnapshotStorage {
    latest: Mutex<Option<RaftSnapshot>>,
}

impl MemorySnapshotStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStorage for MemorySnapshotStorage {
    fn save(&self, snapshot: &RaftSnapshot) -> StoreResult<()> {
        *self.latest.lock() = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> StoreResult<Option<RaftSnapshot>> {
        Ok(self.latest.lock().clone())
    }
}
