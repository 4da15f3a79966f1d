use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use concord_common::error::{ConcordError, Result};
use concord_common::types::{ClusterConfig, NodeId};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::driver::{NodeHandle, SubmitResponse};
use super::node::NodeStatus;
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    Request, RequestVoteRequest, RequestVoteResponse,
};

/// Largest frame accepted off the wire
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Delivers requests to peers and returns their replies.
///
/// Implementations may lose, delay or duplicate messages; callers bound each
/// call with their own timeout.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(&self, to: &NodeId, req: RequestVoteRequest)
        -> Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        to: &NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        to: &NodeId,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

//
// TCP
//

/// Request frame: peer RPCs plus the client commands a node serves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireRequest {
    Raft(Request),
    Submit(Vec<u8>),
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireResponse {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotResponse),
    Submitted(SubmitResponse),
    Status(NodeStatus),
    Error(WireError),
}

/// The parts of [`ConcordError`] a remote caller can act on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireError {
    NotLeader { leader_hint: Option<NodeId> },
    Timeout(String),
    Halted,
    Shutdown,
    Other(String),
}

impl From<ConcordError> for WireError {
    fn from(err: ConcordError) -> Self {
        match err {
            ConcordError::NotLeader { leader_hint } => WireError::NotLeader { leader_hint },
            ConcordError::Timeout(msg) => WireError::Timeout(msg),
            ConcordError::Halted => WireError::Halted,
            ConcordError::Shutdown => WireError::Shutdown,
            other => WireError::Other(other.to_string()),
        }
    }
}

impl From<WireError> for ConcordError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::NotLeader { leader_hint } => ConcordError::NotLeader { leader_hint },
            WireError::Timeout(msg) => ConcordError::Timeout(msg),
            WireError::Halted => ConcordError::Halted,
            WireError::Shutdown => ConcordError::Shutdown,
            WireError::Other(msg) => ConcordError::Consensus(format!("remote error: {msg}")),
        }
    }
}

/// Writes one `[u32 big-endian length][bincode]` frame. Messages the
/// reader would refuse are not written at all.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(message, MAX_FRAME_LEN)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn encode_frame<T: Serialize>(message: &T, limit: u32) -> Result<BytesMut> {
    let payload = bincode::serialize(message)?;
    if payload.len() > limit as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", payload.len()),
        )
        .into());
    }
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    Ok(frame)
}

/// Reads one frame; `None` if the stream ended cleanly before it.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        )
        .into());
    }

    let mut payload = vec![0; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}

/// Sends one request to `addr` over a fresh connection.
pub async fn call(addr: &str, request: &WireRequest) -> Result<WireResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    write_frame(&mut stream, request).await?;
    match read_frame(&mut stream).await? {
        Some(WireResponse::Error(e)) => Err(e.into()),
        Some(response) => Ok(response),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{addr} closed the connection without replying"),
        )
        .into()),
    }
}

fn unexpected(response: WireResponse) -> ConcordError {
    ConcordError::Consensus(format!("unexpected response {response:?}"))
}

/// Talks to peers over TCP at the addresses listed in the cluster config.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    addresses: HashMap<NodeId, String>,
}

impl TcpTransport {
    pub fn new(config: &ClusterConfig) -> Self {
        let addresses = config
            .nodes
            .iter()
            .map(|n| (n.node_id.clone(), n.socket_addr()))
            .collect();
        Self { addresses }
    }

    fn address(&self, to: &str) -> Result<&str> {
        self.addresses
            .get(to)
            .map(String::as_str)
            .ok_or_else(|| ConcordError::Config(format!("no address for node {to}")))
    }

    /// Submits a client command to `to`, which must be the leader.
    pub async fn submit(&self, to: &NodeId, command: Vec<u8>) -> Result<SubmitResponse> {
        match call(self.address(to)?, &WireRequest::Submit(command)).await? {
            WireResponse::Submitted(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&self, to: &NodeId) -> Result<NodeStatus> {
        match call(self.address(to)?, &WireRequest::Status).await? {
            WireResponse::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request_vote(
        &self,
        to: &NodeId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        match call(self.address(to)?, &WireRequest::Raft(Request::RequestVote(req))).await? {
            WireResponse::RequestVote(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    async fn append_entries(
        &self,
        to: &NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        match call(self.address(to)?, &WireRequest::Raft(Request::AppendEntries(req))).await? {
            WireResponse::AppendEntries(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    async fn install_snapshot(
        &self,
        to: &NodeId,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        match call(self.address(to)?, &WireRequest::Raft(Request::InstallSnapshot(req))).await? {
            WireResponse::InstallSnapshot(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }
}

/// Accepts connections on `listener` and feeds their frames to `handle`
/// until the node shuts down.
pub async fn serve(listener: TcpListener, handle: NodeHandle) -> Result<()> {
    info!(node = %handle.id(), addr = %listener.local_addr()?, "listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, &handle).await {
                debug!(node = %handle.id(), %peer, error = %e, "connection closed with error");
            }
        });
    }
}

async fn serve_connection(mut stream: TcpStream, handle: &NodeHandle) -> Result<()> {
    stream.set_nodelay(true)?;
    while let Some(request) = read_frame::<_, WireRequest>(&mut stream).await? {
        let response = dispatch(handle, request).await;
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}

async fn dispatch(handle: &NodeHandle, request: WireRequest) -> WireResponse {
    let result = match request {
        WireRequest::Raft(Request::RequestVote(req)) => {
            handle.request_vote(req).await.map(WireResponse::RequestVote)
        }
        WireRequest::Raft(Request::AppendEntries(req)) => {
            handle.append_entries(req).await.map(WireResponse::AppendEntries)
        }
        WireRequest::Raft(Request::InstallSnapshot(req)) => handle
            .install_snapshot(req)
            .await
            .map(WireResponse::InstallSnapshot),
        WireRequest::Submit(command) => handle.submit(command).await.map(WireResponse::Submitted),
        WireRequest::Status => handle.status().await.map(WireResponse::Status),
    };
    result.unwrap_or_else(|e| WireResponse::Error(e.into()))
}

//
// In-process network
//

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<NodeId, NodeHandle>,
    /// Directed links that currently drop everything
    blocked: HashSet<(NodeId, NodeId)>,
}

/// Routes calls between nodes running in one process, with links that can
/// be cut and restored.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: NodeHandle) {
        self.lock().nodes.insert(handle.id().clone(), handle);
    }

    pub fn transport_for(&self, id: impl Into<NodeId>) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            from: id.into(),
            network: self.clone(),
        })
    }

    /// Cuts every link to and from `id`.
    pub fn isolate(&self, id: &str) {
        let mut state = self.lock();
        let others: Vec<NodeId> = state.nodes.keys().filter(|n| *n != id).cloned().collect();
        for other in others {
            state.blocked.insert((id.to_string(), other.clone()));
            state.blocked.insert((other, id.to_string()));
        }
        warn!(node = id, "isolated");
    }

    /// Cuts every link between nodes of different groups.
    pub fn partition(&self, groups: &[&[&str]]) {
        let mut state = self.lock();
        for (i, a) in groups.iter().enumerate() {
            for (j, b) in groups.iter().enumerate() {
                if i == j {
                    continue;
                }
                for from in a.iter() {
                    for to in b.iter() {
                        state.blocked.insert((from.to_string(), to.to_string()));
                    }
                }
            }
        }
        warn!(groups = ?groups, "partitioned");
    }

    /// Restores every link.
    pub fn heal(&self) {
        self.lock().blocked.clear();
        info!("network healed");
    }

    pub fn is_reachable(&self, from: &str, to: &str) -> bool {
        !self
            .lock()
            .blocked
            .contains(&(from.to_string(), to.to_string()))
    }

    fn route(&self, from: &str, to: &str) -> Result<NodeHandle> {
        let state = self.lock();
        if state.blocked.contains(&(from.to_string(), to.to_string())) {
            return Err(ConcordError::Timeout(format!("link {from} -> {to} is down")));
        }
        state.nodes.get(to).cloned().ok_or_else(|| {
            ConcordError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{to} is not running"),
            ))
        })
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One node's view of a [`LocalNetwork`].
pub struct LocalTransport {
    from: NodeId,
    network: LocalNetwork,
}

impl LocalTransport {
    /// A reply is lost if the link back was cut while the call was running.
    fn deliver<T>(&self, to: &str, reply: Result<T>) -> Result<T> {
        if !self.network.is_reachable(to, &self.from) {
            return Err(ConcordError::Timeout(format!("link {to} -> {} is down", self.from)));
        }
        reply
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(
        &self,
        to: &NodeId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let target = self.network.route(&self.from, to)?;
        let reply = target.request_vote(req).await;
        self.deliver(to, reply)
    }

    async fn append_entries(
        &self,
        to: &NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let target = self.network.route(&self.from, to)?;
        let reply = target.append_entries(req).await;
        self.deliver(to, reply)
    }

    async fn install_snapshot(
        &self,
        to: &NodeId,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let target = self.network.route(&self.from, to)?;
        let reply = target.install_snapshot(req).await;
        self.deliver(to, reply)
    }
}
