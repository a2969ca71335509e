//! The store facade: a replicated string map.
//!
//! Writes go through consensus and block until committed; reads come
//! straight from the local copy of the map and may lag the leader on a
//! follower.

use crate::raft::node::{NodeStatus, RaftNode};
use crate::raft::rpc::{MembershipRequest, MembershipResponse, RaftRequest, RaftResponse};
use crate::raft::runtime::{Event, LeaderSignals, RaftRuntime};
use crate::raft::snapshot::{FileSnapshotStorage, MemorySnapshotStorage, SnapshotStorage};
use crate::raft::state_machine::{Command, KeyValueStore, StateMachine};
use crate::raft::storage::{FileLogStorage, LogStorage, MemoryLogStorage};
use crate::raft::transport::Transport;
use crate::shutdown::Shutdown;
use dnsraft_common::config::NodeConfig;
use dnsraft_common::error::{StoreError, StoreResult};
use dnsraft_common::types::LogIndex;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

const EVENT_QUEUE: usize = 1_024;
const RPC_QUEUE: usize = 1_024;
const SNAPSHOT_FILE: &str = "snapshot.bin";

pub struct Store {
    config: NodeConfig,
    /// Address peers reach this node at; differs from the configured one
    /// only when binding to port 0.
    raft_addr: String,
    state_machine: Arc<KeyValueStore>,
    transport: Arc<dyn Transport>,
    events: mpsc::Sender<Event>,
    leader_rx: watch::Receiver<Option<String>>,
    leader_changes: broadcast::Sender<Option<String>>,
    cancel: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Store {
    /// Opens the node: restores any snapshot and log from `data_dir`, binds
    /// the raft bus and starts the consensus loop.
    ///
    /// A node with no prior state stays passive until `bootstrap` or `join`
    /// is called, or until a leader contacts it.
    pub async fn open(config: NodeConfig, transport: Arc<dyn Transport>) -> StoreResult<Self> {
        config.validate()?;

        let (log_storage, snapshots): (Box<dyn LogStorage>, Box<dyn SnapshotStorage>) =
            match &config.data_dir {
                Some(dir) => (
                    Box::new(FileLogStorage::open(dir)?),
                    Box::new(FileSnapshotStorage::new(dir.join(SNAPSHOT_FILE))),
                ),
                None => (
                    Box::new(MemoryLogStorage),
                    Box::new(MemorySnapshotStorage::new()),
                ),
            };

        let cancel = Shutdown::new();
        let (rpc_tx, rpc_rx) = mpsc::channel(RPC_QUEUE);
        let listener = transport
            .listen(&config.raft_addr, rpc_tx, cancel.clone())
            .await?;
        let raft_addr = listener.local_addr.clone();

        let state_machine = Arc::new(KeyValueStore::new());
        let node = match RaftNode::new(
            config.node_id.clone(),
            raft_addr.clone(),
            log_storage,
            snapshots,
            state_machine.clone(),
        ) {
            Ok(node) => node.with_limits(
                config.raft.max_entries_per_append,
                config.raft.snapshot_threshold,
            ),
            Err(err) => {
                cancel.cancel();
                return Err(err);
            }
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (leader_tx, leader_rx) = watch::channel(None);
        let (leader_changes, _) = broadcast::channel(config.raft.leader_channel_capacity);

        let runtime = RaftRuntime::new(
            node,
            transport.clone(),
            config.raft.clone(),
            events_tx.clone(),
            events_rx,
            rpc_rx,
            cancel.clone(),
            LeaderSignals {
                current: leader_tx,
                changes: leader_changes.clone(),
            },
        );
        let runtime_task = tokio::spawn(runtime.run());

        info!(node_id = %config.node_id, raft_addr = %raft_addr, "store opened");
        Ok(Self {
            config,
            raft_addr,
            state_machine,
            transport,
            events: events_tx,
            leader_rx,
            leader_changes,
            cancel,
            tasks: Mutex::new(vec![listener.task, runtime_task]),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn raft_addr(&self) -> &str {
        &self.raft_addr
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Event) -> StoreResult<T> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Shutdown);
        }
        let (tx, rx) = oneshot::channel();
        self.events
            .send(build(tx))
            .await
            .map_err(|_| StoreError::Shutdown)?;
        rx.await.map_err(|_| StoreError::Shutdown)
    }

    /// Makes this node the sole voter of a new cluster.
    pub async fn bootstrap(&self) -> StoreResult<()> {
        self.request(|reply| Event::Bootstrap { reply }).await?
    }

    /// Asks the cluster reachable at `target` to add this node as a voter.
    /// Redirects to the leader and retries until the propose timeout.
    pub async fn join(&self, target: &str) -> StoreResult<()> {
        let deadline = Instant::now() + self.config.raft.propose_timeout();
        let retry = self.config.raft.heartbeat_interval() * 4;
        let mut target = target.to_string();
        let mut last_error = String::from("no attempt made");

        while Instant::now() < deadline {
            let request = RaftRequest::Membership(MembershipRequest::Join {
                node_id: self.config.node_id.clone(),
                address: self.raft_addr.clone(),
            });
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.transport.call(&target, request)).await {
                Ok(Ok(RaftResponse::Membership(MembershipResponse::Committed { index }))) => {
                    info!(node_id = %self.config.node_id, leader = %target, index, "joined cluster");
                    return Ok(());
                }
                Ok(Ok(RaftResponse::Membership(MembershipResponse::NotLeader { leader }))) => {
                    match leader {
                        Some(leader) if leader != target => {
                            debug!(from = %target, to = %leader, "join redirected to leader");
                            target = leader;
                            continue;
                        }
                        _ => last_error = format!("{} is not the leader", target),
                    }
                }
                Ok(Ok(RaftResponse::Membership(MembershipResponse::Rejected { reason }))) => {
                    last_error = reason;
                }
                Ok(Ok(other)) => last_error = format!("unexpected reply {:?}", other),
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => break,
            }
            warn!(node_id = %self.config.node_id, target = %target, error = %last_error, "join attempt failed");
            tokio::time::sleep(retry).await;
        }
        Err(StoreError::JoinFailed(last_error))
    }

    async fn propose(&self, command: Command) -> StoreResult<LogIndex> {
        let wait = self.config.raft.propose_timeout();
        let pending = self.request(|reply| Event::Propose { command, reply });
        match timeout(wait, pending).await {
            Ok(result) => result?,
            Err(_) => Err(StoreError::Timeout),
        }
    }

    /// Replicates `key = value`. Returns once the write is committed and
    /// applied locally, so a following `get` on this node sees it.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) -> StoreResult<()> {
        self.propose(Command::Set {
            key: key.into(),
            value: value.into(),
        })
        .await
        .map(|_| ())
    }

    pub async fn delete(&self, key: impl Into<String>) -> StoreResult<()> {
        self.propose(Command::Delete { key: key.into() })
            .await
            .map(|_| ())
    }

    /// Local read, no consensus round.
    pub fn get(&self, key: &str) -> Option<String> {
        self.state_machine.get(key)
    }

    /// Best-effort raft address of the current leader.
    pub fn leader(&self) -> Option<String> {
        self.leader_rx.borrow().clone()
    }

    /// Every observed leader change, `None` meaning unknown.
    ///
    /// Delivery is best-effort: the channel is bounded and a receiver that
    /// falls behind loses the oldest notifications.
    pub fn leader_ch(&self) -> broadcast::Receiver<Option<String>> {
        self.leader_changes.subscribe()
    }

    /// Waits until some leader is known, re-checking every `retry_interval`
    /// in case a notification was missed.
    pub async fn wait_for_leader(
        &self,
        wait: Duration,
        retry_interval: Duration,
    ) -> StoreResult<String> {
        let deadline = Instant::now() + wait;
        let mut changes = self.leader_ch();
        loop {
            if let Some(leader) = self.leader() {
                return Ok(leader);
            }
            if self.cancel.is_cancelled() {
                return Err(StoreError::Shutdown);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::Timeout);
            }
            let step = retry_interval.min(deadline - now);
            match timeout(step, changes.recv()).await {
                Ok(Ok(Some(leader))) => return Ok(leader),
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(StoreError::Shutdown),
                _ => {}
            }
        }
    }

    /// Removes a member from the cluster. Must be called on the leader.
    pub async fn remove_node(&self, node_id: &str) -> StoreResult<()> {
        let change = MembershipRequest::Remove {
            node_id: node_id.to_string(),
        };
        let wait = self.config.raft.propose_timeout();
        let pending = self.request(|reply| Event::Membership { change, reply });
        match timeout(wait, pending).await {
            Ok(response) => match response? {
                MembershipResponse::Committed { .. } => Ok(()),
                MembershipResponse::NotLeader { leader } => Err(StoreError::NotLeader { leader }),
                MembershipResponse::Rejected { reason } => Err(StoreError::JoinFailed(reason)),
            },
            Err(_) => Err(StoreError::Timeout),
        }
    }

    pub async fn status(&self) -> StoreResult<NodeStatus> {
        self.request(|reply| Event::Status { reply }).await
    }

    /// Compacts the log now. Returns the snapshot index, or `None` if there
    /// was nothing new to compact.
    pub async fn snapshot(&self) -> StoreResult<Option<LogIndex>> {
        self.request(|reply| Event::Snapshot { reply }).await?
    }

    /// Stops the node: hands off leadership if held, stops every background
    /// task and closes storage. Calling it again is a no-op.
    pub async fn stop(&self) -> StoreResult<()> {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(node_id = %self.config.node_id, error = %err, "background task panicked");
            }
        }
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
