//! Region topology: which servers exist in which region.
//!
//! The membership layer owns this view and refreshes it on its own
//! schedule. The router only reads it and tolerates staleness: a
//! departed server simply fails its query.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;
use warp_core::{ServerConfig, ServerMember};

/// Read-only view of known servers per region.
pub trait RegionTopology: Send + Sync {
    /// Region of the local server.
    fn local_region(&self) -> String;

    /// Servers known in `region`, or `None` if the region is unknown.
    fn servers_in(&self, region: &str) -> Option<Vec<ServerMember>>;

    /// All known region names.
    fn regions(&self) -> Vec<String>;
}

/// Topology held in memory and replaced wholesale per region.
pub struct StaticTopology {
    local_region: String,
    regions: RwLock<HashMap<String, Vec<ServerMember>>>,
}

impl StaticTopology {
    /// An empty topology that knows only the (empty) local region.
    pub fn new(local_region: impl Into<String>) -> Self {
        let local_region = local_region.into();
        let mut regions = HashMap::new();
        regions.insert(local_region.clone(), Vec::new());
        Self {
            local_region,
            regions: RwLock::new(regions),
        }
    }

    /// Build from the `[regions]` tables of a server config.
    pub fn from_config(config: &ServerConfig) -> Self {
        let topology = Self::new(config.server.region.clone());
        for (region, members) in config.members() {
            topology.set_region(&region, members);
        }
        topology
    }

    /// Replace the server list of `region`.
    pub fn set_region(&self, region: &str, servers: Vec<ServerMember>) {
        debug!(region, servers = servers.len(), "region topology updated");
        let mut regions = self.regions.write().expect("topology lock");
        regions.insert(region.to_string(), servers);
    }

    /// Forget `region`. The local region cannot be removed.
    pub fn remove_region(&self, region: &str) -> bool {
        if region == self.local_region {
            return false;
        }
        let mut regions = self.regions.write().expect("topology lock");
        regions.remove(region).is_some()
    }
}

impl RegionTopology for StaticTopology {
    fn local_region(&self) -> String {
        self.local_region.clone()
    }

    fn servers_in(&self, region: &str) -> Option<Vec<ServerMember>> {
        let regions = self.regions.read().expect("topology lock");
        regions.get(region).cloned()
    }

    fn regions(&self) -> Vec<String> {
        let regions = self.regions.read().expect("topology lock");
        let mut names: Vec<String> = regions.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, region: &str, port: u16) -> ServerMember {
        ServerMember::new(name, region, format!("127.0.0.1:{port}").parse().unwrap())
    }

    #[test]
    fn local_region_always_known() {
        let topology = StaticTopology::new("global");
        assert_eq!(topology.servers_in("global"), Some(vec![]));
        assert!(topology.servers_in("eu").is_none());
        assert!(!topology.remove_region("global"));
    }

    #[test]
    fn set_and_remove_region() {
        let topology = StaticTopology::new("global");
        topology.set_region("eu", vec![member("eu-1", "eu", 4647)]);
        assert_eq!(topology.regions(), vec!["eu".to_string(), "global".to_string()]);

        assert!(topology.remove_region("eu"));
        assert!(topology.servers_in("eu").is_none());
    }

    #[test]
    fn from_config_includes_local_server() {
        let config: ServerConfig = toml::from_str(
            r#"
[server]
name = "s1"
region = "global"
rpc_addr = "127.0.0.1:4647"

[[regions.global]]
name = "s2"
rpc_addr = "127.0.0.1:4648"
"#,
        )
        .unwrap();

        let topology = StaticTopology::from_config(&config);
        let servers = topology.servers_in("global").unwrap();
        let mut names: Vec<&str> = servers.iter().map(|s| s.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["s1", "s2"]);
    }
}
