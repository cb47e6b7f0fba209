//! Per-call routing context.

use warp_core::NodeId;

/// Carried alongside a call that targets a specific node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcContext {
    /// Node the call targets.
    pub node_id: NodeId,
    /// Region the node is expected to be connected in.
    pub region: String,
    /// Region the call originated from.
    pub origin_region: String,
}

impl RpcContext {
    pub fn new(node_id: NodeId, region: impl Into<String>, origin_region: impl Into<String>) -> Self {
        Self {
            node_id,
            region: region.into(),
            origin_region: origin_region.into(),
        }
    }

    /// A context for a call that stays inside `region`.
    pub fn local(node_id: NodeId, region: impl Into<String>) -> Self {
        let region = region.into();
        Self {
            node_id,
            origin_region: region.clone(),
            region,
        }
    }

    pub fn is_cross_region(&self) -> bool {
        self.region != self.origin_region
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_region_detection() {
        let same = RpcContext::local(NodeId::from("n1"), "global");
        assert!(!same.is_cross_region());

        let cross = RpcContext::new(NodeId::from("n1"), "eu", "global");
        assert!(cross.is_cross_region());
    }
}
