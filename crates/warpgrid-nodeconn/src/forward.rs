//! Opening node streams from anywhere in the cluster.
//!
//! A stream to a locally connected node goes straight through the
//! [`StreamDispatcher`]. A stream to a node held by a peer is tunnelled
//! through that peer, which opens the stream on its own session and
//! bridges the bytes.

use std::sync::Arc;

use tracing::debug;

use crate::context::RpcContext;
use crate::error::NodeConnResult;
use crate::peer::TcpPeerClient;
use crate::router::{ClusterRouter, NodeRoute};
use crate::session::BoxStream;
use crate::stream::StreamDispatcher;

pub struct NodeStreams {
    router: Arc<ClusterRouter>,
    dispatcher: StreamDispatcher,
    peers: TcpPeerClient,
}

impl NodeStreams {
    pub fn new(router: Arc<ClusterRouter>, dispatcher: StreamDispatcher, peers: TcpPeerClient) -> Self {
        Self {
            router,
            dispatcher,
            peers,
        }
    }

    /// Open `method` on the node named by `ctx`, wherever it is connected.
    pub async fn open(&self, ctx: &RpcContext, method: &str) -> NodeConnResult<BoxStream> {
        match self.router.route(ctx).await? {
            NodeRoute::Local { handle, .. } => self.dispatcher.open_stream(&handle, method).await,
            NodeRoute::Remote { server, .. } => {
                debug!(node_id = %ctx.node_id, peer = %server, method, "forwarding node stream");
                let conn = self.peers.open_stream(&server, &ctx.node_id, method).await?;
                Ok(Box::new(conn))
            }
        }
    }
}
