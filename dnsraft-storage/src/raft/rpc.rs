use super::log::LogEntry;
use super::snapshot::RaftSnapshot;
use dnsraft_common::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// Sent by leader to replicate log entries or as heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,             // Leader’s term
    pub leader_id: NodeId,      // Leader's ID
    pub leader_addr: String,    // Leader's raft address, for redirects
    pub prev_log_index: u64,    // Index of log entry before new ones
    pub prev_log_term: Term,    // Term of that entry
    pub entries: Vec<LogEntry>, // New log entries to store
    pub leader_commit: u64,     // Leader’s commit index
}

/// Response from follower to AppendEntries RPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,    // Current term (may be newer)
    pub success: bool, // True if follower appended entries
    /// Last index known to match the leader's log after this request.
    pub match_index: LogIndex,
    /// On rejection, where the leader should resume sending from.
    pub conflict_index: LogIndex,
}

/// RequestVote RPC: Candidate → Peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Response to RequestVote
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Ships the leader's latest snapshot to a follower that fell behind compaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub leader_addr: String,
    pub snapshot: RaftSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub last_included_index: LogIndex,
}

/// Leadership transfer: tells a caught-up follower to campaign right away
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    pub term: Term,
    pub leader_id: NodeId,
}

/// Membership change requests, served only by the leader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MembershipRequest {
    Join { node_id: NodeId, address: String },
    Remove { node_id: NodeId },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MembershipResponse {
    /// The configuration entry committed at `index`.
    Committed { index: LogIndex },
    NotLeader { leader: Option<String> },
    Rejected { reason: String },
}

/// Every message accepted on the raft bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftRequest {
    AppendEntries(AppendEntriesRequest),
    RequestVote(RequestVoteRequest),
    InstallSnapshot(InstallSnapshotRequest),
    TimeoutNow(TimeoutNowRequest),
    Membership(MembershipRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftResponse {
    AppendEntries(AppendEntriesResponse),
    RequestVote(RequestVoteResponse),
    InstallSnapshot(InstallSnapshotResponse),
    TimeoutNow,
    Membership(MembershipResponse),
}
