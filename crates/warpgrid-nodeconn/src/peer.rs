//! Server-to-server protocol.
//!
//! One request per TCP connection, JSON frames terminated by `\n`:
//!
//! - `has_node_conn` asks a peer whether it holds a live connection to a
//!   node and since when.
//! - `open_stream` asks a peer to open a named stream to one of its own
//!   nodes. After a successful acknowledgement the connection carries
//!   the raw stream bytes.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::debug;
use warp_core::{EstablishedAt, NodeId, ServerMember};

use crate::error::{NodeConnError, NodeConnResult, PeerFailures, QueryError};
use crate::wire::{MAX_FRAME_LEN, read_json, write_json};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A request from one server to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PeerRequest {
    HasNodeConn { node_id: NodeId },
    OpenStream { node_id: NodeId, method: String },
}

/// Wire answer to `has_node_conn`. A non-empty `error` means the peer
/// could not answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HasNodeConnResponse {
    pub found: bool,
    #[serde(default)]
    pub established_at: u64,
    #[serde(default)]
    pub error: String,
}

/// What a peer knows about a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeConnStatus {
    Connected(EstablishedAt),
    NotConnected,
}

impl HasNodeConnResponse {
    pub fn connected(at: EstablishedAt) -> Self {
        Self {
            found: true,
            established_at: at.as_nanos(),
            error: String::new(),
        }
    }

    pub fn not_connected() -> Self {
        Self::default()
    }

    pub fn into_status(self) -> Result<NodeConnStatus, QueryError> {
        if !self.error.is_empty() {
            return Err(QueryError::Remote(self.error));
        }
        Ok(if self.found {
            NodeConnStatus::Connected(EstablishedAt::from_nanos(self.established_at))
        } else {
            NodeConnStatus::NotConnected
        })
    }
}

/// Category of a failed `open_stream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    NoConnection,
    UnknownMethod,
    SessionClosed,
    Handshake,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerFault {
    pub kind: FaultKind,
    pub message: String,
}

impl PeerFault {
    pub fn from_error(err: &NodeConnError) -> Self {
        let kind = match err {
            NodeConnError::NoConnection(_) => FaultKind::NoConnection,
            NodeConnError::UnknownMethod(_) => FaultKind::UnknownMethod,
            NodeConnError::SessionClosed(_) => FaultKind::SessionClosed,
            NodeConnError::Handshake(_) => FaultKind::Handshake,
            _ => FaultKind::Internal,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }

    /// Turn the fault back into the error the remote side hit.
    pub fn into_error(self, node_id: &NodeId, method: &str) -> NodeConnError {
        match self.kind {
            FaultKind::NoConnection => NodeConnError::NoConnection(node_id.clone()),
            FaultKind::UnknownMethod => NodeConnError::UnknownMethod(method.to_string()),
            FaultKind::SessionClosed => NodeConnError::SessionClosed(node_id.clone()),
            FaultKind::Handshake | FaultKind::Internal => NodeConnError::Handshake(self.message),
        }
    }
}

/// Acknowledgement of `open_stream`. `fault` is `None` on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAck {
    pub fault: Option<PeerFault>,
}

/// Asks peer servers about their node connections.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Does `peer` hold a live connection to `node_id`?
    ///
    /// Transport failures are errors, distinct from a clean
    /// `NotConnected`.
    async fn query_node(
        &self,
        peer: &ServerMember,
        node_id: &NodeId,
    ) -> Result<NodeConnStatus, QueryError>;
}

/// Peer client speaking the protocol over TCP.
#[derive(Debug, Clone)]
pub struct TcpPeerClient {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl TcpPeerClient {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bound on waiting for a stream acknowledgement.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn connect(&self, peer: &ServerMember) -> Result<TcpStream, QueryError> {
        let conn = tokio::time::timeout(self.connect_timeout, TcpStream::connect(peer.rpc_addr))
            .await
            .map_err(|_| QueryError::Timeout(self.connect_timeout))?
            .map_err(QueryError::Connect)?;
        conn.set_nodelay(true)?;
        Ok(conn)
    }

    /// Ask `peer` to open `method` on its connection to `node_id`.
    ///
    /// The returned TCP connection is bridged to the node stream.
    pub async fn open_stream(
        &self,
        peer: &ServerMember,
        node_id: &NodeId,
        method: &str,
    ) -> NodeConnResult<TcpStream> {
        let unreachable = |error: QueryError| {
            let mut failures = PeerFailures::default();
            failures.push(peer.clone(), error);
            NodeConnError::QueryFailed {
                node_id: node_id.clone(),
                failures,
            }
        };

        let mut conn = self.connect(peer).await.map_err(unreachable)?;
        let request = PeerRequest::OpenStream {
            node_id: node_id.clone(),
            method: method.to_string(),
        };
        write_json(&mut conn, &request).await?;

        let ack: StreamAck = tokio::time::timeout(self.request_timeout, read_json(&mut conn, MAX_FRAME_LEN))
            .await
            .map_err(|_| NodeConnError::Handshake("peer did not acknowledge stream".into()))??
            .ok_or_else(|| {
                NodeConnError::Handshake("peer closed connection before acknowledgement".into())
            })?;

        match ack.fault {
            None => {
                debug!(peer = %peer, %node_id, method, "forwarded node stream opened");
                Ok(conn)
            }
            Some(fault) => Err(fault.into_error(node_id, method)),
        }
    }
}

impl Default for TcpPeerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerClient for TcpPeerClient {
    async fn query_node(
        &self,
        peer: &ServerMember,
        node_id: &NodeId,
    ) -> Result<NodeConnStatus, QueryError> {
        let mut conn = self.connect(peer).await?;
        let request = PeerRequest::HasNodeConn {
            node_id: node_id.clone(),
        };
        write_json(&mut conn, &request).await?;

        let response: HasNodeConnResponse = read_json(&mut conn, MAX_FRAME_LEN)
            .await?
            .ok_or_else(|| QueryError::Protocol("peer closed connection without a response".into()))?;
        response.into_status()
    }
}
