//! Shared types used across WarpGrid crates.

use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Opaque, stable identifier of a worker node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Moment a node connection was accepted by a server.
///
/// Nanoseconds since the UNIX epoch. Values from different servers are
/// compared directly, so server clocks are assumed to be loosely
/// synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EstablishedAt(u64);

impl EstablishedAt {
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EstablishedAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A control-plane server as seen by the membership layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerMember {
    pub name: String,
    pub region: String,
    pub rpc_addr: SocketAddr,
}

impl ServerMember {
    pub fn new(name: impl Into<String>, region: impl Into<String>, rpc_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            rpc_addr,
        }
    }
}

impl fmt::Display for ServerMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} ({})", self.name, self.region, self.rpc_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_serializes_as_plain_string() {
        let id = NodeId::from("node-abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"node-abc\"");
        let back: NodeId = serde_json::from_str("\"node-abc\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn established_at_orders_by_time() {
        let older = EstablishedAt::from_nanos(10);
        let newer = EstablishedAt::from_nanos(20);
        assert!(newer > older);
        assert!(EstablishedAt::now() > newer);
    }

    #[test]
    fn server_member_display() {
        let m = ServerMember::new("s1", "global", "127.0.0.1:4647".parse().unwrap());
        assert_eq!(m.to_string(), "s1.global (127.0.0.1:4647)");
    }
}
