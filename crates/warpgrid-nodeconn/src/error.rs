//! Error types for node connection routing.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use warp_core::{NodeId, ServerMember};

/// Result type alias for routing and stream operations.
pub type NodeConnResult<T> = Result<T, NodeConnError>;

/// Errors surfaced to callers of the router and stream dispatcher.
///
/// Nothing in this crate retries on its own; callers decide which of
/// these are worth retrying.
#[derive(Debug, Error)]
pub enum NodeConnError {
    #[error("no path to region {0:?}")]
    RegionUnknown(String),

    #[error("no path to node {0}")]
    NoConnection(NodeId),

    #[error("failed querying servers for node {node_id}: {failures}")]
    QueryFailed {
        node_id: NodeId,
        failures: PeerFailures,
    },

    #[error("unknown rpc method: {0:?}")]
    UnknownMethod(String),

    #[error("session for node {0} is closed")]
    SessionClosed(NodeId),

    #[error("stream handshake failed: {0}")]
    Handshake(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeConnError {
    /// Whether retrying the same call later could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeConnError::NoConnection(_)
                | NodeConnError::QueryFailed { .. }
                | NodeConnError::SessionClosed(_)
                | NodeConnError::Io(_)
        )
    }
}

/// Failure of a single server-to-server query.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("connect: {0}")]
    Connect(std::io::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("abandoned at resolve deadline")]
    DeadlineExceeded,

    #[error("query task failed: {0}")]
    Task(String),
}

/// Errors from the multiplexed session capability.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    #[error("session io: {0}")]
    Io(#[from] std::io::Error),
}

/// A peer that could not answer during a fan-out.
#[derive(Debug)]
pub struct PeerFailure {
    pub server: ServerMember,
    pub error: QueryError,
}

/// Every peer failure collected during one resolution.
#[derive(Debug, Default)]
pub struct PeerFailures(Vec<PeerFailure>);

impl PeerFailures {
    pub fn push(&mut self, server: ServerMember, error: QueryError) {
        self.0.push(PeerFailure { server, error });
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerFailure> {
        self.0.iter()
    }
}

impl fmt::Display for PeerFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", failure.server, failure.error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, port: u16) -> ServerMember {
        ServerMember::new(name, "global", format!("127.0.0.1:{port}").parse().unwrap())
    }

    #[test]
    fn query_failed_lists_every_peer() {
        let mut failures = PeerFailures::default();
        failures.push(member("s2", 4648), QueryError::Timeout(Duration::from_secs(2)));
        failures.push(member("s3", 4649), QueryError::Remote("boom".into()));

        let err = NodeConnError::QueryFailed {
            node_id: NodeId::from("n1"),
            failures,
        };
        let msg = err.to_string();
        assert!(msg.starts_with("failed querying"));
        assert!(msg.contains("s2.global (127.0.0.1:4648): timed out"));
        assert!(msg.contains("s3.global (127.0.0.1:4649): remote error: boom"));
    }

    #[test]
    fn unknown_method_message_quotes_name() {
        let err = NodeConnError::UnknownMethod("Bogus".into());
        assert_eq!(err.to_string(), "unknown rpc method: \"Bogus\"");
    }

    #[test]
    fn transient_classification() {
        assert!(!NodeConnError::RegionUnknown("mars".into()).is_transient());
        assert!(!NodeConnError::UnknownMethod("x".into()).is_transient());
        assert!(NodeConnError::NoConnection(NodeId::from("n1")).is_transient());
        assert!(NodeConnError::SessionClosed(NodeId::from("n1")).is_transient());
    }
}
