pub type NodeId = String;
pub type Term = u64;
pub type LogIndex = u64;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One voting member of the cluster and the address its raft bus listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub node_id: NodeId,
    pub address: String,
}

/// The replicated cluster configuration.
///
/// Stored in the log as configuration entries, so membership changes are
/// ordered with data changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMembership {
    members: BTreeMap<NodeId, String>,
}

impl ClusterMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(node_id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        let mut membership = Self::new();
        membership.insert(node_id, address);
        membership
    }

    pub fn insert(&mut self, node_id: impl Into<NodeId>, address: impl Into<String>) {
        self.members.insert(node_id.into(), address.into());
    }

    pub fn remove(&mut self, node_id: &str) -> Option<String> {
        self.members.remove(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.members.contains_key(node_id)
    }

    pub fn address_of(&self, node_id: &str) -> Option<&str> {
        self.members.get(node_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Number of votes needed for a majority of this configuration.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.members.keys()
    }

    pub fn members(&self) -> impl Iterator<Item = ClusterMember> + '_ {
        self.members.iter().map(|(id, addr)| ClusterMember {
            node_id: id.clone(),
            address: addr.clone(),
        })
    }
}
