//! Common test utilities for multi-node store tests.

use std::path::PathBuf;
use std::time::Duration;

use dnsraft_common::config::NodeConfig;
use dnsraft_storage::{MemoryNetwork, NodeRole, Store};
use tempfile::TempDir;

/// Timing tuned for fast in-process clusters.
pub fn node_config(addr: &str, data_dir: Option<PathBuf>, snapshot_threshold: u64) -> NodeConfig {
    let mut builder = NodeConfig::builder()
        .node_id(addr)
        .raft_addr(addr)
        .heartbeat_interval_ms(20)
        .election_timeout_ms(150, 300)
        .propose_timeout_ms(2_000)
        .snapshot_threshold(snapshot_threshold);
    if let Some(dir) = data_dir {
        builder = builder.data_dir(dir);
    }
    builder.build().expect("Invalid config")
}

/// Test context holding the network, temp directories and nodes.
#[allow(dead_code)]
pub struct TestCluster {
    /// Temp directories for each node (kept alive for the test duration).
    _temp_dirs: Vec<TempDir>,
    data_dirs: Vec<Option<PathBuf>>,
    pub network: MemoryNetwork,
    /// `None` while a node is stopped.
    pub nodes: Vec<Option<Store>>,
    pub addresses: Vec<String>,
    snapshot_threshold: u64,
}

#[allow(dead_code)]
impl TestCluster {
    /// Starts `node_count` nodes, bootstraps the first and joins the rest.
    pub async fn new(node_count: usize) -> Self {
        Self::with_options(node_count, false, 1_024).await
    }

    pub async fn with_options(node_count: usize, persistent: bool, snapshot_threshold: u64) -> Self {
        let mut cluster = Self {
            _temp_dirs: Vec::new(),
            data_dirs: Vec::new(),
            network: MemoryNetwork::new(),
            nodes: Vec::new(),
            addresses: Vec::new(),
            snapshot_threshold,
        };

        for _ in 0..node_count {
            let data_dir = if persistent {
                let dir = TempDir::new().expect("Failed to create temp dir");
                let path = dir.path().to_path_buf();
                cluster._temp_dirs.push(dir);
                Some(path)
            } else {
                None
            };
            cluster.add_node(data_dir).await;
        }

        cluster.node(0).bootstrap().await.expect("Failed to bootstrap");
        cluster.wait_for_leader(Duration::from_secs(3)).await;
        for i in 1..node_count {
            cluster.join(i).await;
        }
        cluster
    }

    /// Opens one more node without joining it.
    pub async fn add_node(&mut self, data_dir: Option<PathBuf>) -> usize {
        let index = self.nodes.len();
        let addr = format!("node-{}", index + 1);
        let config = node_config(&addr, data_dir.clone(), self.snapshot_threshold);
        let store = Store::open(config, self.network.transport(addr.as_str()))
            .await
            .expect("Failed to open store");
        self.addresses.push(addr);
        self.data_dirs.push(data_dir);
        self.nodes.push(Some(store));
        index
    }

    pub async fn join(&self, index: usize) {
        self.node(index)
            .join(&self.addresses[0])
            .await
            .expect("Failed to join");
    }

    pub fn node(&self, index: usize) -> &Store {
        self.nodes[index].as_ref().expect("node is stopped")
    }

    pub fn running(&self) -> impl Iterator<Item = (usize, &Store)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, node)| node.as_ref().map(|n| (i, n)))
    }

    /// Index of a running node that believes it leads, preferring the one
    /// with the highest term.
    pub async fn current_leader(&self) -> Option<usize> {
        let mut best: Option<(u64, usize)> = None;
        for (i, node) in self.running() {
            if let Ok(status) = node.status().await {
                if status.role == NodeRole::Leader && best.map_or(true, |(term, _)| status.term > term) {
                    best = Some((status.term, i));
                }
            }
        }
        best.map(|(_, i)| i)
    }

    /// Waits for a leader to be elected.
    pub async fn wait_for_leader(&self, timeout: Duration) -> usize {
        self.wait_for_leader_except(None, timeout).await
    }

    pub async fn wait_for_leader_except(&self, excluded: Option<usize>, timeout: Duration) -> usize {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if let Some(leader) = self.current_leader().await {
                if Some(leader) != excluded {
                    return leader;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no leader elected within {:?}", timeout);
    }

    /// Waits until every running node reads `expected` for `key`.
    pub async fn wait_for_value(&self, key: &str, expected: Option<&str>, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if self.running().all(|(_, node)| node.get(key).as_deref() == expected) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    pub async fn stop_node(&mut self, index: usize) {
        if let Some(node) = self.nodes[index].take() {
            node.stop().await.expect("Failed to stop node");
        }
    }

    /// Reopens a stopped node at the same address and data directory.
    pub async fn restart_node(&mut self, index: usize) {
        let addr = self.addresses[index].clone();
        let config = node_config(&addr, self.data_dirs[index].clone(), self.snapshot_threshold);
        let store = Store::open(config, self.network.transport(addr.as_str()))
            .await
            .expect("Failed to reopen store");
        self.nodes[index] = Some(store);
    }

    /// Shutdown all nodes.
    pub async fn shutdown(&mut self) {
        for i in 0..self.nodes.len() {
            self.stop_node(i).await;
        }
    }
}
