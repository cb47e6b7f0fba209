//! Peer-facing server.
//!
//! Answers `has_node_conn` and `open_stream` requests from other servers
//! using only the local connection registry. A server never forwards a
//! peer request onwards, so a request cannot loop between servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use warp_core::{NodeId, ServerMember};

use crate::error::{NodeConnError, NodeConnResult};
use crate::peer::{HasNodeConnResponse, PeerFault, PeerRequest, StreamAck};
use crate::registry::ConnectionRegistry;
use crate::stream::StreamDispatcher;
use crate::wire::{MAX_FRAME_LEN, read_json, write_json};

/// How long a peer may take to send its request line.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PeerServer {
    local: ServerMember,
    registry: ConnectionRegistry,
    dispatcher: StreamDispatcher,
}

impl PeerServer {
    pub fn new(local: ServerMember, registry: ConnectionRegistry, dispatcher: StreamDispatcher) -> Self {
        Self {
            local,
            registry,
            dispatcher,
        }
    }

    /// Accept peer connections until `shutdown` flips to `true`.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        info!(server = %self.local, %addr, "peer server listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (conn, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "peer accept failed");
                            continue;
                        }
                    };
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_conn(conn, remote).await {
                            debug!(%remote, error = %e, "peer connection ended with error");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(server = %self.local, "peer server stopped");
        Ok(())
    }

    async fn handle_conn(&self, mut conn: TcpStream, remote: SocketAddr) -> NodeConnResult<()> {
        conn.set_nodelay(true)?;

        let request = tokio::time::timeout(
            REQUEST_READ_TIMEOUT,
            read_json::<PeerRequest, _>(&mut conn, MAX_FRAME_LEN),
        )
        .await;

        // Malformed or missing requests get no reply; a partial reply
        // could be mistaken for a negative answer.
        let request = match request {
            Ok(Ok(Some(request))) => request,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => {
                warn!(%remote, error = %e, "malformed peer request");
                return Ok(());
            }
            Err(_) => {
                debug!(%remote, "peer request timed out");
                return Ok(());
            }
        };

        match request {
            PeerRequest::HasNodeConn { node_id } => {
                let response = self.has_node_conn(&node_id);
                write_json(&mut conn, &response).await?;
                Ok(())
            }
            PeerRequest::OpenStream { node_id, method } => {
                self.forward_stream(conn, remote, &node_id, &method).await
            }
        }
    }

    /// Answer from the local registry only.
    pub fn has_node_conn(&self, node_id: &NodeId) -> HasNodeConnResponse {
        match self.registry.get(node_id) {
            Some(handle) => {
                debug!(%node_id, established_at = %handle.established_at, "peer asked for connected node");
                HasNodeConnResponse::connected(handle.established_at)
            }
            None => HasNodeConnResponse::not_connected(),
        }
    }

    async fn forward_stream(
        &self,
        mut conn: TcpStream,
        remote: SocketAddr,
        node_id: &NodeId,
        method: &str,
    ) -> NodeConnResult<()> {
        let opened = match self.registry.get(node_id) {
            Some(handle) => self.dispatcher.open_stream(&handle, method).await,
            None => Err(NodeConnError::NoConnection(node_id.clone())),
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                debug!(%remote, %node_id, method, error = %e, "refusing forwarded stream");
                let ack = StreamAck {
                    fault: Some(PeerFault::from_error(&e)),
                };
                write_json(&mut conn, &ack).await?;
                return Ok(());
            }
        };

        write_json(&mut conn, &StreamAck { fault: None }).await?;
        debug!(%remote, %node_id, method, "bridging forwarded stream");

        let (up, down) = tokio::io::copy_bidirectional(&mut conn, &mut stream).await?;
        debug!(%node_id, method, bytes_up = up, bytes_down = down, "forwarded stream closed");
        Ok(())
    }
}
