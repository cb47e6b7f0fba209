//! Server mode: owns the connection registry and answers peer queries.
//!
//! In this mode, the daemon:
//! 1. Loads and logs the region topology from the config file
//! 2. Creates the connection registry that node transports register into
//! 3. Serves the peer protocol on `rpc_addr`
//! 4. On Ctrl-C, stops the listener and drains the registry
//!
//! Cluster routing is driven by callers (`warpd resolve`, or an embedding
//! service holding a `ClusterRouter`); the server only answers peers.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use warp_core::ServerConfig;
use warpgrid_nodeconn::{
    ConnectionRegistry, PeerServer, RegionTopology, StaticTopology, StreamDispatcher,
};

pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let local = config.local_member();
    info!(server = %local, "WarpGrid server starting");

    // ── Topology and registry ────────────────────────────────────
    let topology = StaticTopology::from_config(&config);
    for region in topology.regions() {
        let servers = topology.servers_in(&region).map(|s| s.len()).unwrap_or(0);
        info!(region = %region, servers, "region topology loaded");
    }

    let registry = ConnectionRegistry::new();
    let dispatcher = StreamDispatcher::new(config.stream_handshake_timeout());

    // ── Peer protocol ────────────────────────────────────────────
    let listener = TcpListener::bind(local.rpc_addr).await?;
    let peer_server = Arc::new(PeerServer::new(local.clone(), registry.clone(), dispatcher));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_handle = tokio::spawn(peer_server.serve(listener, shutdown_rx));

    // ── Wait for shutdown ────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "peer server exited with error"),
        Err(e) => warn!(error = %e, "peer server task failed"),
    }

    let drained = registry.drain();
    info!(connections = drained.len(), "node connections released");
    info!("WarpGrid server stopped");
    Ok(())
}
