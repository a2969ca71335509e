//! The raft bus: how nodes reach each other.
//!
//! `TcpTransport` frames each message as a big-endian `u32` length followed
//! by a bincode body, one request and one response per exchange.
//! `MemoryNetwork` wires nodes in-process and can cut links, which is what
//! the cluster tests use.

use super::rpc::{RaftRequest, RaftResponse};
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use dnsraft_common::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
const IDLE_CONNECTIONS_PER_PEER: usize = 4;

/// A request received from a peer, with the slot its answer goes into.
#[derive(Debug)]
pub struct InboundRpc {
    pub request: RaftRequest,
    pub reply: oneshot::Sender<RaftResponse>,
}

/// A bound listener feeding the node's inbox.
pub struct RpcListener {
    pub local_addr: String,
    pub task: JoinHandle<()>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one request to the node listening at `target` and waits for its
    /// answer. Deadlines are applied by the caller.
    async fn call(&self, target: &str, request: RaftRequest) -> StoreResult<RaftResponse>;

    /// Starts accepting requests on `addr` until `cancel` fires.
    async fn listen(
        &self,
        addr: &str,
        inbox: mpsc::Sender<InboundRpc>,
        cancel: Shutdown,
    ) -> StoreResult<RpcListener>;
}

/// Length prefix plus body. Bodies over `max_len` are refused here, since
/// the receiving side would drop them anyway.
fn encode_frame<T: serde::Serialize>(message: &T, max_len: usize) -> StoreResult<Vec<u8>> {
    let body = bincode::serialize(message)?;
    if body.len() > max_len {
        warn!(
            len = body.len(),
            limit = max_len,
            "outgoing raft message exceeds frame limit, not sent"
        );
        return Err(StoreError::Codec(format!(
            "frame of {} bytes exceeds limit of {}",
            body.len(),
            max_len
        )));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

async fn write_frame<W, T>(writer: &mut W, message: &T) -> StoreResult<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let frame = encode_frame(message, MAX_FRAME_LEN)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R, T>(reader: &mut R) -> StoreResult<T>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(StoreError::Codec(format!("frame of {} bytes exceeds limit", len)));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

/// Raft bus over TCP, reusing idle connections per peer.
#[derive(Default)]
pub struct TcpTransport {
    idle: Mutex<HashMap<String, Vec<TcpStream>>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn connection(&self, target: &str) -> StoreResult<TcpStream> {
        let pooled = self.idle.lock().get_mut(target).and_then(Vec::pop);
        match pooled {
            Some(stream) => Ok(stream),
            None => Ok(TcpStream::connect(target).await?),
        }
    }

    fn release(&self, target: &str, stream: TcpStream) {
        let mut idle = self.idle.lock();
        let slot = idle.entry(target.to_string()).or_default();
        if slot.len() < IDLE_CONNECTIONS_PER_PEER {
            slot.push(stream);
        }
    }

    async fn serve_connection(mut stream: TcpStream, inbox: mpsc::Sender<InboundRpc>) -> StoreResult<()> {
        loop {
            let request: RaftRequest = match read_frame(&mut stream).await {
                Ok(request) => request,
                Err(StoreError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            let (reply, answer) = oneshot::channel();
            if inbox.send(InboundRpc { request, reply }).await.is_err() {
                return Err(StoreError::Shutdown);
            }
            let response = answer.await.map_err(|_| StoreError::Shutdown)?;
            write_frame(&mut stream, &response).await?;
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, target: &str, request: RaftRequest) -> StoreResult<RaftResponse> {
        let mut stream = self.connection(target).await?;
        write_frame(&mut stream, &request).await?;
        let response = read_frame(&mut stream).await?;
        self.release(target, stream);
        Ok(response)
    }

    async fn listen(
        &self,
        addr: &str,
        inbox: mpsc::Sender<InboundRpc>,
        cancel: Shutdown,
    ) -> StoreResult<RpcListener> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?.to_string();
        debug!(addr = %local_addr, "raft bus listening");

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let inbox = inbox.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = cancel.cancelled() => {}
                                    result = Self::serve_connection(stream, inbox) => {
                                        if let Err(err) = result {
                                            debug!(peer = %peer, error = %err, "raft connection closed");
                                        }
                                    }
                                }
                            });
                        }
                        Err(err) => warn!(error = %err, "raft bus accept failed"),
                    },
                }
            }
        });

        Ok(RpcListener { local_addr, task })
    }
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<String, mpsc::Sender<InboundRpc>>,
    isolated: HashSet<String>,
    cut: HashSet<(String, String)>,
}

impl NetworkState {
    fn reachable(&self, from: &str, to: &str) -> bool {
        !self.isolated.contains(from)
            && !self.isolated.contains(to)
            && !self.cut.contains(&(from.to_string(), to.to_string()))
    }
}

/// In-process network shared by every node of a test cluster.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose outgoing calls originate from `local_addr`.
    pub fn transport(&self, local_addr: impl Into<String>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            local_addr: local_addr.into(),
        })
    }

    /// Drops every message to or from `addr`.
    pub fn isolate(&self, addr: &str) {
        self.state.lock().isolated.insert(addr.to_string());
    }

    /// Cuts the link between `a` and `b` in both directions.
    pub fn partition(&self, a: &str, b: &str) {
        let mut state = self.state.lock();
        state.cut.insert((a.to_string(), b.to_string()));
        state.cut.insert((b.to_string(), a.to_string()));
    }

    /// Restores full connectivity.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.isolated.clear();
        state.cut.clear();
    }

    fn unreachable(from: &str, to: &str) -> StoreError {
        StoreError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("{} cannot reach {}", from, to),
        ))
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    local_addr: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn call(&self, target: &str, request: RaftRequest) -> StoreResult<RaftResponse> {
        let inbox = {
            let state = self.network.state.lock();
            if !state.reachable(&self.local_addr, target) {
                return Err(MemoryNetwork::unreachable(&self.local_addr, target));
            }
            state
                .endpoints
                .get(target)
                .cloned()
                .ok_or_else(|| MemoryNetwork::unreachable(&self.local_addr, target))?
        };

        let (reply, answer) = oneshot::channel();
        inbox
            .send(InboundRpc { request, reply })
            .await
            .map_err(|_| MemoryNetwork::unreachable(&self.local_addr, target))?;
        let response = answer
            .await
            .map_err(|_| MemoryNetwork::unreachable(&self.local_addr, target))?;

        // The link may have been cut while the request was in flight.
        if !self.network.state.lock().reachable(target, &self.local_addr) {
            return Err(MemoryNetwork::unreachable(target, &self.local_addr));
        }
        Ok(response)
    }

    async fn listen(
        &self,
        addr: &str,
        inbox: mpsc::Sender<InboundRpc>,
        cancel: Shutdown,
    ) -> StoreResult<RpcListener> {
        {
            let mut state = self.network.state.lock();
            if state.endpoints.get(addr).is_some_and(|tx| !tx.is_closed()) {
                return Err(StoreError::Io(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} already registered", addr),
                )));
            }
            state.endpoints.insert(addr.to_string(), inbox);
        }

        let network = self.network.clone();
        let local_addr = addr.to_string();
        let registered = local_addr.clone();
        let task = tokio::spawn(async move {
            cancel.cancelled().await;
            network.state.lock().endpoints.remove(&registered);
        });
        Ok(RpcListener { local_addr, task })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::rpc::{RequestVoteRequest, RequestVoteResponse};

    fn vote_request() -> RaftRequest {
        RaftRequest::RequestVote(RequestVoteRequest {
            term: 3,
            candidate_id: "n1".into(),
            last_log_index: 10,
            last_log_term: 2,
        })
    }

    /// Answers every vote request with a grant until the inbox closes.
    fn spawn_voter(mut inbox: mpsc::Receiver<InboundRpc>) {
        tokio::spawn(async move {
            while let Some(rpc) = inbox.recv().await {
                let term = match rpc.request {
                    RaftRequest::RequestVote(req) => req.term,
                    _ => 0,
                };
                let _ = rpc.reply.send(RaftResponse::RequestVote(RequestVoteResponse {
                    term,
                    vote_granted: true,
                }));
            }
        });
    }

    #[tokio::test]
    async fn test_oversized_frame_is_refused_by_sender() {
        let frame = encode_frame(&vote_request(), 1_024).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);

        let result = encode_frame(&vote_request(), 8);
        assert!(matches!(result, Err(StoreError::Codec(_))));

        let mut sink: Vec<u8> = Vec::new();
        let decoded: RaftRequest = read_frame(&mut frame.as_slice()).await.unwrap();
        assert!(matches!(decoded, RaftRequest::RequestVote(ref req) if req.term == 3));
        write_frame(&mut sink, &decoded).await.unwrap();
        assert_eq!(sink, frame);
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let server = TcpTransport::new();
        let (tx, rx) = mpsc::channel(8);
        let cancel = Shutdown::new();
        let listener = server.listen("127.0.0.1:0", tx, cancel.clone()).await.unwrap();
        spawn_voter(rx);

        let client = TcpTransport::new();
        for _ in 0..3 {
            match client.call(&listener.local_addr, vote_request()).await.unwrap() {
                RaftResponse::RequestVote(resp) => {
                    assert!(resp.vote_granted);
                    assert_eq!(resp.term, 3);
                }
                other => panic!("unexpected response {:?}", other),
            }
        }

        cancel.cancel();
        listener.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_network_partition() {
        let network = MemoryNetwork::new();
        let (tx, rx) = mpsc::channel(8);
        let cancel = Shutdown::new();
        network
            .transport("b")
            .listen("b", tx, cancel.clone())
            .await
            .unwrap();
        spawn_voter(rx);

        let a = network.transport("a");
        assert!(a.call("b", vote_request()).await.is_ok());

        network.partition("a", "b");
        assert!(a.call("b", vote_request()).await.is_err());

        network.heal();
        assert!(a.call("b", vote_request()).await.is_ok());

        network.isolate("b");
        assert!(a.call("b", vote_request()).await.is_err());
        network.heal();

        cancel.cancel();
        tokio::task::yield_now().await;
        assert!(a.call("nowhere", vote_request()).await.is_err());
    }
}
