//! The task that owns a `RaftNode` and drives it.
//!
//! A single loop serialises everything that touches consensus state: timer
//! expiries, requests from peers, answers to our own requests, and calls from
//! the store facade. Peer RPCs run on spawned tasks and report back through
//! the same event channel, so the loop never waits on the network.

use super::node::{Applied, NodeRole, NodeStatus, Outbound, RaftNode};
use super::rpc::{MembershipRequest, MembershipResponse, RaftRequest, RaftResponse};
use super::state_machine::Command;
use super::transport::{InboundRpc, Transport};
use crate::shutdown::Shutdown;
use dnsraft_common::config::RaftConfig;
use dnsraft_common::error::{StoreError, StoreResult};
use dnsraft_common::types::{LogIndex, NodeId, Term};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Requests from the facade, plus answers to our own peer RPCs.
#[derive(Debug)]
pub(crate) enum Event {
    Bootstrap {
        reply: oneshot::Sender<StoreResult<()>>,
    },
    Propose {
        command: Command,
        reply: oneshot::Sender<StoreResult<LogIndex>>,
    },
    Membership {
        change: MembershipRequest,
        reply: oneshot::Sender<MembershipResponse>,
    },
    Snapshot {
        reply: oneshot::Sender<StoreResult<Option<LogIndex>>>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    PeerReply {
        from: NodeId,
        response: RaftResponse,
    },
}

/// Where a membership change reports back: the local facade, or a peer
/// that sent us a `Join`/`Remove` over the raft bus.
enum MembershipReply {
    Local(oneshot::Sender<MembershipResponse>),
    Remote(oneshot::Sender<RaftResponse>),
}

impl MembershipReply {
    fn send(self, response: MembershipResponse) {
        match self {
            MembershipReply::Local(tx) => {
                let _ = tx.send(response);
            }
            MembershipReply::Remote(tx) => {
                let _ = tx.send(RaftResponse::Membership(response));
            }
        }
    }
}

enum Waiter {
    Propose(oneshot::Sender<StoreResult<LogIndex>>),
    Membership(MembershipReply),
}

impl Waiter {
    fn complete(self, index: LogIndex) {
        match self {
            Waiter::Propose(tx) => {
                let _ = tx.send(Ok(index));
            }
            Waiter::Membership(reply) => reply.send(MembershipResponse::Committed { index }),
        }
    }

    fn fail(self, err: StoreError) {
        match self {
            Waiter::Propose(tx) => {
                let _ = tx.send(Err(err));
            }
            Waiter::Membership(reply) => {
                let response = match err {
                    StoreError::NotLeader { leader } => MembershipResponse::NotLeader { leader },
                    other => MembershipResponse::Rejected {
                        reason: other.to_string(),
                    },
                };
                reply.send(response);
            }
        }
    }
}

/// Channels the facade uses to observe leadership.
pub(crate) struct LeaderSignals {
    pub current: watch::Sender<Option<String>>,
    pub changes: broadcast::Sender<Option<String>>,
}

pub(crate) struct RaftRuntime {
    node: RaftNode,
    transport: Arc<dyn Transport>,
    config: RaftConfig,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    rpc_rx: mpsc::Receiver<InboundRpc>,
    cancel: Shutdown,
    leader: LeaderSignals,
    published_leader: Option<String>,
    pending: BTreeMap<LogIndex, (Term, Waiter)>,
    /// Last AppendEntries or InstallSnapshot reply from each peer.
    peer_contact: HashMap<NodeId, Instant>,
    leader_since: Instant,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
}

impl RaftRuntime {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node: RaftNode,
        transport: Arc<dyn Transport>,
        config: RaftConfig,
        events_tx: mpsc::Sender<Event>,
        events_rx: mpsc::Receiver<Event>,
        rpc_rx: mpsc::Receiver<InboundRpc>,
        cancel: Shutdown,
        leader: LeaderSignals,
    ) -> Self {
        let now = Instant::now();
        let mut runtime = Self {
            node,
            transport,
            config,
            events_tx,
            events_rx,
            rpc_rx,
            cancel,
            leader,
            published_leader: None,
            pending: BTreeMap::new(),
            peer_contact: HashMap::new(),
            leader_since: now,
            election_deadline: now,
            heartbeat_deadline: now,
        };
        runtime.reset_election_timer();
        runtime
    }

    fn reset_election_timer(&mut self) {
        let (min, max) = self.config.election_timeout();
        self.election_deadline = Instant::now() + rand::thread_rng().gen_range(min..=max);
    }

    fn next_deadline(&self) -> Instant {
        if self.node.is_leader() {
            self.heartbeat_deadline
        } else {
            self.election_deadline
        }
    }

    pub(crate) async fn run(mut self) {
        info!(node_id = %self.node.id, addr = %self.node.addr, "raft runtime started");
        loop {
            let was_leader = self.node.is_leader();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep_until(self.next_deadline()) => self.on_timer(),
                Some(rpc) = self.rpc_rx.recv() => self.on_rpc(rpc),
                Some(event) = self.events_rx.recv() => self.on_event(event),
            }
            self.after_event(was_leader);
        }
        self.shutdown().await;
    }

    /// True while a majority of voters has answered within the last max
    /// election timeout. A fresh leader gets one full window.
    fn has_quorum_contact(&self) -> bool {
        let window = self.config.election_timeout().1;
        let now = Instant::now();
        if now.duration_since(self.leader_since) < window {
            return true;
        }
        let membership = self.node.membership();
        let reached = membership
            .ids()
            .filter(|id| {
                **id == self.node.id
                    || self
                        .peer_contact
                        .get(*id)
                        .is_some_and(|at| now.duration_since(*at) < window)
            })
            .count();
        reached >= membership.quorum()
    }

    fn on_timer(&mut self) {
        if self.node.is_leader() {
            if !self.has_quorum_contact() {
                warn!(
                    node_id = %self.node.id,
                    term = self.node.current_term(),
                    "no contact with a majority, stepping down"
                );
                if let Err(err) = self.node.step_down() {
                    error!(node_id = %self.node.id, error = %err, "step down failed");
                }
                return;
            }
            let out = self.node.replicate_all();
            self.dispatch(out);
            self.heartbeat_deadline = Instant::now() + self.config.heartbeat_interval();
        } else {
            self.reset_election_timer();
            match self.node.start_election() {
                Ok(out) => {
                    if self.node.is_leader() {
                        self.heartbeat_deadline = Instant::now() + self.config.heartbeat_interval();
                    }
                    self.dispatch(out);
                }
                Err(err) => error!(node_id = %self.node.id, error = %err, "failed to start election"),
            }
        }
    }

    fn on_rpc(&mut self, rpc: InboundRpc) {
        let response = match rpc.request {
            RaftRequest::AppendEntries(req) => {
                match self.node.handle_append_entries(req) {
                    Ok((resp, reset)) => {
                        if reset {
                            self.reset_election_timer();
                        }
                        RaftResponse::AppendEntries(resp)
                    }
                    Err(err) => {
                        error!(node_id = %self.node.id, error = %err, "append entries failed");
                        return;
                    }
                }
            }
            RaftRequest::RequestVote(req) => match self.node.handle_request_vote(req) {
                Ok((resp, granted)) => {
                    if granted {
                        self.reset_election_timer();
                    }
                    RaftResponse::RequestVote(resp)
                }
                Err(err) => {
                    error!(node_id = %self.node.id, error = %err, "vote handling failed");
                    return;
                }
            },
            RaftRequest::InstallSnapshot(req) => match self.node.handle_install_snapshot(req) {
                Ok((resp, reset)) => {
                    if reset {
                        self.reset_election_timer();
                    }
                    RaftResponse::InstallSnapshot(resp)
                }
                Err(err) => {
                    error!(node_id = %self.node.id, error = %err, "snapshot install failed");
                    return;
                }
            },
            RaftRequest::TimeoutNow(req) => {
                match self.node.handle_timeout_now(req) {
                    Ok(out) => {
                        self.reset_election_timer();
                        self.dispatch(out);
                    }
                    Err(err) => error!(node_id = %self.node.id, error = %err, "timeout-now failed"),
                }
                RaftResponse::TimeoutNow
            }
            RaftRequest::Membership(change) => {
                self.on_membership(change, MembershipReply::Remote(rpc.reply));
                return;
            }
        };
        let _ = rpc.reply.send(response);
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Bootstrap { reply } => {
                let result = self.node.bootstrap().map(|out| self.dispatch(out));
                if result.is_ok() {
                    self.heartbeat_deadline = Instant::now() + self.config.heartbeat_interval();
                }
                let _ = reply.send(result);
            }
            Event::Propose { command, reply } => match self.node.propose(&command) {
                Ok(index) => {
                    let term = self.node.current_term();
                    self.pending.insert(index, (term, Waiter::Propose(reply)));
                    let out = self.node.replicate_all();
                    self.dispatch(out);
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Event::Membership { change, reply } => {
                self.on_membership(change, MembershipReply::Local(reply))
            }
            Event::Snapshot { reply } => {
                let _ = reply.send(self.node.take_snapshot());
            }
            Event::Status { reply } => {
                let _ = reply.send(self.node.status());
            }
            Event::PeerReply { from, response } => {
                if matches!(
                    response,
                    RaftResponse::AppendEntries(_) | RaftResponse::InstallSnapshot(_)
                ) {
                    self.peer_contact.insert(from.clone(), Instant::now());
                }
                let result = match response {
                    RaftResponse::AppendEntries(resp) => {
                        self.node.handle_append_entries_response(from, resp)
                    }
                    RaftResponse::RequestVote(resp) => self.node.handle_vote_response(from, resp),
                    RaftResponse::InstallSnapshot(resp) => {
                        self.node.handle_install_snapshot_response(from, resp)
                    }
                    RaftResponse::TimeoutNow | RaftResponse::Membership(_) => Ok(Vec::new()),
                };
                match result {
                    Ok(out) => {
                        if self.node.is_leader() && !out.is_empty() {
                            self.heartbeat_deadline =
                                Instant::now() + self.config.heartbeat_interval();
                        }
                        self.dispatch(out)
                    }
                    Err(err) => error!(node_id = %self.node.id, error = %err, "peer reply handling failed"),
                }
            }
        }
    }

    fn on_membership(
        &mut self,
        change: MembershipRequest,
        reply: MembershipReply,
    ) {
        match self.node.propose_membership(&change) {
            Ok(Some(index)) => {
                // A new voter counts as reachable until its first window ends.
                if let MembershipRequest::Join { node_id, .. } = &change {
                    self.peer_contact.insert(node_id.clone(), Instant::now());
                }
                let term = self.node.current_term();
                self.pending.insert(index, (term, Waiter::Membership(reply)));
                let out = self.node.replicate_all();
                self.dispatch(out);
            }
            Ok(None) => reply.send(MembershipResponse::Committed {
                index: self.node.commit_index(),
            }),
            Err(err) => Waiter::Membership(reply).fail(err),
        }
    }

    /// Applies newly committed entries, releases waiters and publishes
    /// leadership changes.
    fn after_event(&mut self, was_leader: bool) {
        match self.node.apply_committed_entries() {
            Ok(applied) => self.resolve(&applied),
            Err(err) => error!(node_id = %self.node.id, error = %err, "apply failed"),
        }

        if !was_leader && self.node.is_leader() {
            self.leader_since = Instant::now();
            self.peer_contact.clear();
        }

        if was_leader && !self.node.is_leader() {
            let leader = self.node.leader_addr().map(str::to_string);
            warn!(
                node_id = %self.node.id,
                pending = self.pending.len(),
                "lost leadership, failing pending proposals"
            );
            for (_, (_, waiter)) in std::mem::take(&mut self.pending) {
                waiter.fail(StoreError::NotLeader {
                    leader: leader.clone(),
                });
            }
            self.reset_election_timer();
        }

        self.publish_leader();
    }

    fn resolve(&mut self, applied: &[Applied]) {
        for entry in applied {
            if let Some((term, waiter)) = self.pending.remove(&entry.index) {
                if term == entry.term {
                    waiter.complete(entry.index);
                } else {
                    waiter.fail(StoreError::NotLeader {
                        leader: self.node.leader_addr().map(str::to_string),
                    });
                }
            }
        }
    }

    fn publish_leader(&mut self) {
        let current = self.node.leader_addr().map(str::to_string);
        if current == self.published_leader {
            return;
        }
        info!(
            node_id = %self.node.id,
            term = self.node.current_term(),
            leader = ?current,
            "leader changed"
        );
        self.published_leader = current.clone();
        self.leader.current.send_replace(current.clone());
        // No subscribers is fine; lagging ones lose the oldest entries.
        let _ = self.leader.changes.send(current);
    }

    fn dispatch(&self, out: Vec<Outbound>) {
        for Outbound { to, addr, request } in out {
            let transport = self.transport.clone();
            let events = self.events_tx.clone();
            let rpc_timeout = self.config.rpc_timeout();
            tokio::spawn(async move {
                match timeout(rpc_timeout, transport.call(&addr, request)).await {
                    Ok(Ok(response)) => {
                        let _ = events.send(Event::PeerReply { from: to, response }).await;
                    }
                    Ok(Err(err)) => debug!(peer = %to, error = %err, "raft rpc failed"),
                    Err(_) => debug!(peer = %to, "raft rpc timed out"),
                }
            });
        }
    }

    async fn shutdown(mut self) {
        if self.node.role() == NodeRole::Leader {
            if let Some(Outbound { to, addr, request }) = self.node.transfer_leadership() {
                info!(node_id = %self.node.id, target = %to, "transferring leadership");
                let rpc_timeout = self.config.rpc_timeout();
                match timeout(rpc_timeout, self.transport.call(&addr, request)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => debug!(peer = %to, error = %err, "leadership transfer failed"),
                    Err(_) => debug!(peer = %to, "leadership transfer timed out"),
                }
            }
            if let Err(err) = self.node.step_down() {
                warn!(node_id = %self.node.id, error = %err, "step down failed");
            }
        }

        for (_, (_, waiter)) in std::mem::take(&mut self.pending) {
            waiter.fail(StoreError::Shutdown);
        }
        self.events_rx.close();
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                Event::Bootstrap { reply } => {
                    let _ = reply.send(Err(StoreError::Shutdown));
                }
                Event::Propose { reply, .. } => {
                    let _ = reply.send(Err(StoreError::Shutdown));
                }
                Event::Membership { reply, .. } => {
                    Waiter::Membership(MembershipReply::Local(reply)).fail(StoreError::Shutdown)
                }
                Event::Snapshot { reply } => {
                    let _ = reply.send(Err(StoreError::Shutdown));
                }
                Event::Status { reply } => {
                    let _ = reply.send(self.node.status());
                }
                Event::PeerReply { .. } => {}
            }
        }

        self.leader.current.send_replace(None);
        if self.published_leader.take().is_some() {
            let _ = self.leader.changes.send(None);
        }

        if let Err(err) = self.node.close() {
            error!(node_id = %self.node.id, error = %err, "failed to close raft storage");
        }
        info!(node_id = %self.node.id, "raft runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::snapshot::MemorySnapshotStorage;
    use crate::raft::state_machine::KeyValueStore;
    use crate::raft::storage::MemoryLogStorage;
    use crate::raft::transport::MemoryNetwork;
    use std::time::Duration;

    fn fast_config() -> RaftConfig {
        RaftConfig {
            heartbeat_interval_ms: 5,
            election_timeout_ms: (20, 40),
            ..RaftConfig::default()
        }
    }

    fn test_runtime(addr: &str, bootstrap: bool) -> RaftRuntime {
        test_runtime_with(addr, bootstrap, RaftConfig::default())
    }

    fn test_runtime_with(addr: &str, bootstrap: bool, config: RaftConfig) -> RaftRuntime {
        let mut node = RaftNode::new(
            addr.into(),
            addr.into(),
            Box::new(MemoryLogStorage),
            Box::new(MemorySnapshotStorage::new()),
            Arc::new(KeyValueStore::new()),
        )
        .unwrap();
        if bootstrap {
            node.bootstrap().unwrap();
            node.apply_committed_entries().unwrap();
        }
        let network = MemoryNetwork::new();
        let (events_tx, events_rx) = mpsc::channel(16);
        let (_rpc_tx, rpc_rx) = mpsc::channel(16);
        let (current, _) = watch::channel(None);
        let (changes, _) = broadcast::channel(4);
        RaftRuntime::new(
            node,
            network.transport(addr),
            config,
            events_tx,
            events_rx,
            rpc_rx,
            Shutdown::new(),
            LeaderSignals { current, changes },
        )
    }

    fn join_rpc(node_id: &str) -> (InboundRpc, oneshot::Receiver<RaftResponse>) {
        let (reply, rx) = oneshot::channel();
        let rpc = InboundRpc {
            request: RaftRequest::Membership(MembershipRequest::Join {
                node_id: node_id.into(),
                address: node_id.into(),
            }),
            reply,
        };
        (rpc, rx)
    }

    #[tokio::test]
    async fn test_remote_join_on_follower_redirects() {
        let mut runtime = test_runtime("rt-follower", false);
        let (rpc, mut rx) = join_rpc("rt-new");

        runtime.on_rpc(rpc);

        assert!(matches!(
            rx.try_recv().unwrap(),
            RaftResponse::Membership(MembershipResponse::NotLeader { leader: None })
        ));
    }

    #[tokio::test]
    async fn test_remote_join_of_existing_member_commits_at_once() {
        let mut runtime = test_runtime("rt-leader", true);
        let (rpc, mut rx) = join_rpc("rt-leader");

        runtime.on_rpc(rpc);

        assert!(matches!(
            rx.try_recv().unwrap(),
            RaftResponse::Membership(MembershipResponse::Committed { .. })
        ));
        assert!(runtime.pending.is_empty());
    }

    #[tokio::test]
    async fn test_remote_join_waits_then_fails_on_step_down() {
        let mut runtime = test_runtime("rt-leader", true);
        let (rpc, mut rx) = join_rpc("rt-new");

        runtime.on_rpc(rpc);
        assert_eq!(runtime.pending.len(), 1);
        assert!(rx.try_recv().is_err());

        runtime.node.step_down().unwrap();
        runtime.after_event(true);

        assert!(runtime.pending.is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            RaftResponse::Membership(MembershipResponse::NotLeader { .. })
        ));
    }

    #[tokio::test]
    async fn test_leader_without_majority_contact_steps_down() {
        let mut runtime = test_runtime_with("rt-leader", true, fast_config());
        // The pending join makes rt-new a voter, so a majority needs its acks.
        let (rpc, mut rx) = join_rpc("rt-new");
        runtime.on_rpc(rpc);

        tokio::time::sleep(Duration::from_millis(60)).await;
        runtime.on_timer();
        runtime.after_event(true);

        assert!(!runtime.node.is_leader());
        assert_eq!(runtime.node.leader_addr(), None);
        assert_eq!(*runtime.leader.current.borrow(), None);
        assert!(runtime.pending.is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            RaftResponse::Membership(MembershipResponse::NotLeader { leader: None })
        ));
    }

    #[tokio::test]
    async fn test_single_voter_leader_keeps_leading() {
        let mut runtime = test_runtime_with("rt-solo", true, fast_config());

        tokio::time::sleep(Duration::from_millis(60)).await;
        runtime.on_timer();
        runtime.after_event(true);

        assert!(runtime.node.is_leader());
    }
}
