use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dnsraft_common::error::{StoreError, StoreResult};
use dnsraft_storage::Store;
use tracing::{error, info, warn};

use crate::zone::{parse_zone, ParsedZone};

pub const DEFAULT_LEADER_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of one zone load. Loads are not atomic: some records may have
/// been written even when others failed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub applied: usize,
    pub failed: usize,
    pub parse_errors: usize,
    /// True when this node is not the leader and left the writes to it.
    pub skipped: bool,
}

/// Writes the records of a zone file into the store.
pub struct ZoneLoader {
    store: Arc<Store>,
    path: PathBuf,
    origin: Option<String>,
    leader_timeout: Duration,
    retry_interval: Duration,
}

impl ZoneLoader {
    pub fn new(store: Arc<Store>, path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            path: path.into(),
            origin: None,
            leader_timeout: DEFAULT_LEADER_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Origin for relative names when the file has no `$ORIGIN`.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_leader_wait(mut self, timeout: Duration, retry_interval: Duration) -> Self {
        self.leader_timeout = timeout;
        self.retry_interval = retry_interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads, parses and applies the zone file.
    ///
    /// Waits for a leader first; if none shows up within the leader timeout
    /// the load is abandoned with `Timeout`.
    pub async fn load(&self) -> StoreResult<LoadReport> {
        let input = tokio::fs::read_to_string(&self.path).await?;
        let zone = parse_zone(&input, self.origin.as_deref());
        for err in &zone.errors {
            warn!(path = %self.path.display(), error = %err, "skipping malformed zone record");
        }

        let leader = match self
            .store
            .wait_for_leader(self.leader_timeout, self.retry_interval)
            .await
        {
            Ok(leader) => leader,
            Err(err) => {
                error!(
                    path = %self.path.display(),
                    timeout = ?self.leader_timeout,
                    error = %err,
                    "no leader available, zone not loaded"
                );
                return Err(err);
            }
        };

        if leader != self.store.raft_addr() {
            info!(
                path = %self.path.display(),
                leader = %leader,
                "not the leader, zone load left to the leader"
            );
            return Ok(LoadReport {
                parse_errors: zone.errors.len(),
                skipped: true,
                ..LoadReport::default()
            });
        }

        let report = self.apply(zone).await;
        info!(
            path = %self.path.display(),
            applied = report.applied,
            failed = report.failed,
            parse_errors = report.parse_errors,
            "zone loaded"
        );
        Ok(report)
    }

    async fn apply(&self, zone: ParsedZone) -> LoadReport {
        let mut report = LoadReport {
            parse_errors: zone.errors.len(),
            ..LoadReport::default()
        };
        for record in zone.records {
            let key = record.key();
            match self.store.set(key.as_str(), record.to_string()).await {
                Ok(()) => report.applied += 1,
                Err(err) => {
                    warn!(key = %key, error = %err, "failed to store zone record");
                    report.failed += 1;
                    if matches!(err, StoreError::Shutdown) {
                        break;
                    }
                }
            }
        }
        report
    }
}
