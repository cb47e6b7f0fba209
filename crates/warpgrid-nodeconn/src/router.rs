//! Cluster router: find the server that holds a node's connection.
//!
//! Resolution order for `(node_id, region)`:
//!
//! 1. Unknown region fails with `RegionUnknown` before any network call.
//! 2. A local registry hit is returned without network calls.
//! 3. Every other server in the region is queried concurrently, bounded
//!    by `max_concurrent_queries`, each query under its own timeout.
//! 4. All answers are collected. The positive answer with the newest
//!    `EstablishedAt` wins; equal timestamps go to the lower server name.
//! 5. Any positive answer wins over failed queries. With no positive
//!    answer, a single failed query turns the result into `QueryFailed`,
//!    otherwise it is `NoConnection`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};
use warp_core::config::{DEFAULT_MAX_CONCURRENT_QUERIES, DEFAULT_QUERY_TIMEOUT};
use warp_core::{EstablishedAt, NodeId, ServerConfig, ServerMember};

use crate::context::RpcContext;
use crate::error::{NodeConnError, NodeConnResult, PeerFailures, QueryError};
use crate::peer::{NodeConnStatus, PeerClient};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::topology::RegionTopology;

/// Fan-out tuning.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Deadline for each individual peer query.
    pub query_timeout: Duration,
    /// Upper bound on peer queries in flight for one resolution.
    pub max_concurrent_queries: usize,
    /// Overall deadline applied by [`ClusterRouter::resolve`].
    pub resolve_deadline: Option<Duration>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            max_concurrent_queries: DEFAULT_MAX_CONCURRENT_QUERIES,
            resolve_deadline: None,
        }
    }
}

impl RouterConfig {
    pub fn from_server_config(config: &ServerConfig) -> Self {
        Self {
            query_timeout: config.query_timeout(),
            max_concurrent_queries: config.max_concurrent_queries(),
            resolve_deadline: config.resolve_deadline(),
        }
    }
}

/// Where a node can be reached.
#[derive(Debug, Clone)]
pub enum NodeRoute {
    /// The node is connected to this server.
    Local {
        server: ServerMember,
        handle: ConnectionHandle,
    },
    /// The node is connected to a peer; forward the call there.
    Remote {
        server: ServerMember,
        established_at: EstablishedAt,
    },
}

impl NodeRoute {
    pub fn server(&self) -> &ServerMember {
        match self {
            NodeRoute::Local { server, .. } | NodeRoute::Remote { server, .. } => server,
        }
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.server().rpc_addr
    }

    pub fn is_local(&self) -> bool {
        matches!(self, NodeRoute::Local { .. })
    }

    pub fn established_at(&self) -> EstablishedAt {
        match self {
            NodeRoute::Local { handle, .. } => handle.established_at,
            NodeRoute::Remote { established_at, .. } => *established_at,
        }
    }
}

/// Resolves node locations across the servers of a region.
pub struct ClusterRouter {
    local: ServerMember,
    registry: ConnectionRegistry,
    topology: Arc<dyn RegionTopology>,
    peers: Arc<dyn PeerClient>,
    config: RouterConfig,
}

impl ClusterRouter {
    pub fn new(
        local: ServerMember,
        registry: ConnectionRegistry,
        topology: Arc<dyn RegionTopology>,
        peers: Arc<dyn PeerClient>,
        config: RouterConfig,
    ) -> Self {
        Self {
            local,
            registry,
            topology,
            peers,
            config,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Resolve `node_id` in `region`, honouring the configured
    /// `resolve_deadline` if any.
    ///
    /// A deadline too far out to represent is treated as no deadline.
    pub async fn resolve(&self, node_id: &NodeId, region: &str) -> NodeConnResult<NodeRoute> {
        let deadline = self
            .config
            .resolve_deadline
            .and_then(|d| Instant::now().checked_add(d));
        self.resolve_inner(node_id, region, deadline).await
    }

    /// Resolve with a caller-supplied deadline.
    ///
    /// Queries still outstanding at `deadline` are aborted and count as
    /// failures; answers that arrived before it are used as usual.
    pub async fn resolve_by(
        &self,
        node_id: &NodeId,
        region: &str,
        deadline: Instant,
    ) -> NodeConnResult<NodeRoute> {
        self.resolve_inner(node_id, region, Some(deadline)).await
    }

    /// Resolve the target of a forwarded call.
    pub async fn route(&self, ctx: &RpcContext) -> NodeConnResult<NodeRoute> {
        if ctx.is_cross_region() {
            debug!(
                node_id = %ctx.node_id,
                region = %ctx.region,
                origin = %ctx.origin_region,
                "routing cross-region call"
            );
        }
        self.resolve(&ctx.node_id, &ctx.region).await
    }

    async fn resolve_inner(
        &self,
        node_id: &NodeId,
        region: &str,
        deadline: Option<Instant>,
    ) -> NodeConnResult<NodeRoute> {
        let servers = self
            .topology
            .servers_in(region)
            .ok_or_else(|| NodeConnError::RegionUnknown(region.to_string()))?;

        if let Some(handle) = self.registry.get(node_id) {
            debug!(%node_id, region, "node is connected locally");
            return Ok(NodeRoute::Local {
                server: self.local.clone(),
                handle,
            });
        }

        // Only the local region can list this server.
        let local_region = region == self.topology.local_region();
        let candidates: Vec<ServerMember> = servers
            .into_iter()
            .filter(|s| !(local_region && s.name == self.local.name))
            .collect();

        if candidates.is_empty() {
            debug!(%node_id, region, "no peer servers to query");
            return Err(NodeConnError::NoConnection(node_id.clone()));
        }

        let outcome = self.fan_out(node_id, candidates, deadline).await;
        let route = outcome.finish(node_id);
        match &route {
            Ok(route) => debug!(
                %node_id,
                region,
                server = %route.server(),
                established_at = %route.established_at(),
                "resolved node to peer server"
            ),
            Err(e) => debug!(%node_id, region, error = %e, "node resolution failed"),
        }
        route
    }

    async fn fan_out(
        &self,
        node_id: &NodeId,
        candidates: Vec<ServerMember>,
        deadline: Option<Instant>,
    ) -> FanOut {
        let limit = Arc::new(Semaphore::new(self.config.max_concurrent_queries.max(1)));
        let query_timeout = self.config.query_timeout;
        let mut pending: HashMap<usize, ServerMember> = HashMap::with_capacity(candidates.len());
        let mut tasks = JoinSet::new();

        for (idx, server) in candidates.into_iter().enumerate() {
            pending.insert(idx, server.clone());
            let peers = Arc::clone(&self.peers);
            let limit = Arc::clone(&limit);
            let node_id = node_id.clone();
            tasks.spawn(async move {
                let result = match limit.acquire_owned().await {
                    Ok(_permit) => {
                        match tokio::time::timeout(query_timeout, peers.query_node(&server, &node_id)).await {
                            Ok(result) => result,
                            Err(_) => Err(QueryError::Timeout(query_timeout)),
                        }
                    }
                    Err(_) => Err(QueryError::Task("query limiter closed".into())),
                };
                (idx, result)
            });
        }

        let mut outcome = FanOut::default();
        let mut deadline_hit = false;
        let mut task_error: Option<String> = None;

        loop {
            let joined = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        deadline_hit = true;
                        break;
                    }
                },
                None => tasks.join_next().await,
            };

            match joined {
                None => break,
                Some(Ok((idx, result))) => {
                    if let Some(server) = pending.remove(&idx) {
                        outcome.record(node_id, server, result);
                    }
                }
                Some(Err(e)) => {
                    warn!(%node_id, error = %e, "peer query task failed");
                    task_error = Some(e.to_string());
                }
            }
        }

        if deadline_hit {
            tasks.abort_all();
            debug!(%node_id, outstanding = pending.len(), "resolve deadline reached");
        }

        let mut leftover: Vec<(usize, ServerMember)> = pending.into_iter().collect();
        leftover.sort_by_key(|(idx, _)| *idx);
        for (_, server) in leftover {
            let error = match &task_error {
                Some(msg) if !deadline_hit => QueryError::Task(msg.clone()),
                _ => QueryError::DeadlineExceeded,
            };
            outcome.record(node_id, server, Err(error));
        }
        outcome
    }
}

/// Accumulates fan-out answers.
#[derive(Debug, Default)]
struct FanOut {
    best: Option<(ServerMember, EstablishedAt)>,
    failures: PeerFailures,
}

impl FanOut {
    fn record(
        &mut self,
        node_id: &NodeId,
        server: ServerMember,
        result: Result<NodeConnStatus, QueryError>,
    ) {
        match result {
            Ok(NodeConnStatus::Connected(at)) => {
                debug!(%node_id, peer = %server, established_at = %at, "peer holds node connection");
                let replace = match &self.best {
                    Some((best, best_at)) => is_fresher(&server, at, best, *best_at),
                    None => true,
                };
                if replace {
                    self.best = Some((server, at));
                }
            }
            Ok(NodeConnStatus::NotConnected) => {}
            Err(error) => {
                warn!(
                    %node_id,
                    peer = %server.name,
                    addr = %server.rpc_addr,
                    error = %error,
                    "peer query failed"
                );
                self.failures.push(server, error);
            }
        }
    }

    fn finish(self, node_id: &NodeId) -> NodeConnResult<NodeRoute> {
        match self.best {
            Some((server, established_at)) => Ok(NodeRoute::Remote {
                server,
                established_at,
            }),
            None if !self.failures.is_empty() => Err(NodeConnError::QueryFailed {
                node_id: node_id.clone(),
                failures: self.failures,
            }),
            None => Err(NodeConnError::NoConnection(node_id.clone())),
        }
    }
}

/// Newer connections win; equal timestamps go to the lower server name.
fn is_fresher(
    candidate: &ServerMember,
    candidate_at: EstablishedAt,
    best: &ServerMember,
    best_at: EstablishedAt,
) -> bool {
    candidate_at > best_at || (candidate_at == best_at && candidate.name < best.name)
}
