//! warpgrid.toml server configuration parser.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ServerMember;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_CONCURRENT_QUERIES: usize = 8;
pub const DEFAULT_STREAM_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub routing: Option<RoutingConfig>,
    /// Known servers per region. The local server belongs to its own
    /// region whether or not it is listed here.
    #[serde(default)]
    pub regions: BTreeMap<String, Vec<PeerConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    pub name: String,
    pub region: String,
    pub rpc_addr: SocketAddr,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub query_timeout: Option<String>,
    pub resolve_deadline: Option<String>,
    pub max_concurrent_queries: Option<usize>,
    pub stream_handshake_timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub rpc_addr: SocketAddr,
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a single-server configuration.
    pub fn scaffold(name: &str, region: &str, rpc_addr: SocketAddr) -> Self {
        ServerConfig {
            server: ServerSection {
                name: name.to_string(),
                region: region.to_string(),
                rpc_addr,
            },
            routing: Some(RoutingConfig {
                query_timeout: Some("2s".to_string()),
                resolve_deadline: Some("5s".to_string()),
                max_concurrent_queries: Some(DEFAULT_MAX_CONCURRENT_QUERIES),
                stream_handshake_timeout: Some("5s".to_string()),
            }),
            regions: BTreeMap::new(),
        }
    }

    /// Check the fields serde cannot check on its own.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.name.trim().is_empty() {
            anyhow::bail!("server.name must not be empty");
        }
        if self.server.region.trim().is_empty() {
            anyhow::bail!("server.region must not be empty");
        }
        if let Some(routing) = &self.routing {
            for (field, value) in [
                ("query_timeout", &routing.query_timeout),
                ("resolve_deadline", &routing.resolve_deadline),
                ("stream_handshake_timeout", &routing.stream_handshake_timeout),
            ] {
                if let Some(raw) = value {
                    if parse_duration(raw).is_none() {
                        anyhow::bail!("routing.{field}: invalid duration {raw:?}");
                    }
                }
            }
            if routing.max_concurrent_queries == Some(0) {
                anyhow::bail!("routing.max_concurrent_queries must be at least 1");
            }
        }
        for (region, peers) in &self.regions {
            if region.trim().is_empty() {
                anyhow::bail!("regions: empty region name");
            }
            if let Some(peer) = peers.iter().find(|p| p.name.trim().is_empty()) {
                anyhow::bail!("regions.{region}: server at {} has no name", peer.rpc_addr);
            }
        }
        Ok(())
    }

    pub fn local_member(&self) -> ServerMember {
        ServerMember::new(
            self.server.name.clone(),
            self.server.region.clone(),
            self.server.rpc_addr,
        )
    }

    /// All known servers grouped by region, local server included.
    pub fn members(&self) -> BTreeMap<String, Vec<ServerMember>> {
        let mut out: BTreeMap<String, Vec<ServerMember>> = BTreeMap::new();
        for (region, peers) in &self.regions {
            let members = out.entry(region.clone()).or_default();
            for peer in peers {
                members.push(ServerMember::new(peer.name.clone(), region.clone(), peer.rpc_addr));
            }
        }

        let local = self.local_member();
        let own = out.entry(local.region.clone()).or_default();
        if !own.iter().any(|m| m.name == local.name) {
            own.push(local);
        }
        out
    }

    pub fn query_timeout(&self) -> Duration {
        self.routing
            .as_ref()
            .and_then(|r| r.query_timeout.as_deref())
            .and_then(parse_duration)
            .unwrap_or(DEFAULT_QUERY_TIMEOUT)
    }

    /// Overall deadline for one resolution, if configured.
    pub fn resolve_deadline(&self) -> Option<Duration> {
        self.routing
            .as_ref()
            .and_then(|r| r.resolve_deadline.as_deref())
            .and_then(parse_duration)
    }

    pub fn max_concurrent_queries(&self) -> usize {
        self.routing
            .as_ref()
            .and_then(|r| r.max_concurrent_queries)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_QUERIES)
            .max(1)
    }

    pub fn stream_handshake_timeout(&self) -> Duration {
        self.routing
            .as_ref()
            .and_then(|r| r.stream_handshake_timeout.as_deref())
            .and_then(parse_duration)
            .unwrap_or(DEFAULT_STREAM_HANDSHAKE_TIMEOUT)
    }
}

/// Parse a duration string like "5s", "500ms", "1m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[server]
name = "server-1"
region = "global"
rpc_addr = "127.0.0.1:4647"

[routing]
query_timeout = "500ms"
max_concurrent_queries = 4

[[regions.global]]
name = "server-2"
rpc_addr = "127.0.0.1:4648"

[[regions.global]]
name = "server-1"
rpc_addr = "127.0.0.1:4647"

[[regions.eu]]
name = "eu-1"
rpc_addr = "10.1.0.1:4647"
"#;

    #[test]
    fn scaffold_round_trips_through_toml() {
        let config = ServerConfig::scaffold("s1", "global", "127.0.0.1:4647".parse().unwrap());
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("s1"));
        assert!(toml_str.contains("127.0.0.1:4647"));
        config.validate().unwrap();
    }

    #[test]
    fn parse_minimal() {
        let toml_str = r#"
[server]
name = "solo"
region = "global"
rpc_addr = "0.0.0.0:4647"
"#;
        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.name, "solo");
        assert!(config.regions.is_empty());
        assert_eq!(config.query_timeout(), DEFAULT_QUERY_TIMEOUT);
        assert_eq!(config.max_concurrent_queries(), DEFAULT_MAX_CONCURRENT_QUERIES);
        assert!(config.resolve_deadline().is_none());

        let members = config.members();
        assert_eq!(members["global"].len(), 1);
        assert_eq!(members["global"][0].name, "solo");
    }

    #[test]
    fn members_include_local_once() {
        let config: ServerConfig = toml::from_str(SAMPLE).unwrap();
        let members = config.members();
        assert_eq!(members.len(), 2);
        assert_eq!(members["global"].len(), 2);
        assert_eq!(members["eu"][0].region, "eu");
        assert_eq!(config.query_timeout(), Duration::from_millis(500));
        assert_eq!(config.max_concurrent_queries(), 4);
    }

    #[test]
    fn validate_rejects_bad_duration() {
        let mut config: ServerConfig = toml::from_str(SAMPLE).unwrap();
        config.routing.as_mut().unwrap().query_timeout = Some("soon".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("query_timeout"));
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config: ServerConfig = toml::from_str(SAMPLE).unwrap();
        config.routing.as_mut().unwrap().max_concurrent_queries = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("3s"), Some(Duration::from_secs(3)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("later"), None);
    }

    #[test]
    fn overflowing_minutes_are_rejected() {
        assert_eq!(parse_duration("18446744073709551615m"), None);

        let mut config: ServerConfig = toml::from_str(SAMPLE).unwrap();
        config.routing.as_mut().unwrap().resolve_deadline = Some("18446744073709551615m".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("resolve_deadline"));
    }
}
