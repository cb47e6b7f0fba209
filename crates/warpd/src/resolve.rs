//! One-shot node lookup for operators.

use std::sync::Arc;

use anyhow::Context;
use warp_core::{NodeId, ServerConfig};
use warpgrid_nodeconn::{
    ClusterRouter, ConnectionRegistry, NodeRoute, RouterConfig, StaticTopology, TcpPeerClient,
};

/// Ask the configured servers which of them holds `node` and print the
/// answer as JSON.
pub async fn run_resolve(
    config: ServerConfig,
    node: String,
    region: Option<String>,
) -> anyhow::Result<()> {
    let region = region.unwrap_or_else(|| config.server.region.clone());
    let node_id = NodeId::new(node);

    // The lookup process holds no node connections of its own, so every
    // configured server, including the one named in [server], is asked.
    let mut local = config.local_member();
    local.name = format!("{}-resolve", local.name);

    let router = ClusterRouter::new(
        local,
        ConnectionRegistry::new(),
        Arc::new(StaticTopology::from_config(&config)),
        Arc::new(TcpPeerClient::new()),
        RouterConfig::from_server_config(&config),
    );

    let route = router
        .resolve(&node_id, &region)
        .await
        .with_context(|| format!("resolving node {node_id} in region {region:?}"))?;

    println!("{}", serde_json::to_string_pretty(&route_json(&node_id, &region, &route))?);
    Ok(())
}

fn route_json(node_id: &NodeId, region: &str, route: &NodeRoute) -> serde_json::Value {
    serde_json::json!({
        "node_id": node_id,
        "region": region,
        "server": route.server().name,
        "rpc_addr": route.addr().to_string(),
        "established_at": route.established_at().as_nanos(),
        "local": route.is_local(),
    })
}
