//! Node connection routing for WarpGrid control-plane servers.
//!
//! Every worker node keeps one long-lived connection to one server. Any
//! server can still reach any node: it looks the node up locally, asks
//! its peers otherwise, and either serves the call itself or forwards it
//! to the server that owns the connection.
//!
//! # Architecture
//!
//! ```text
//! Server A                                  Server B (peer)
//!   ├── ClusterRouter                         ├── PeerServer (TCP)
//!   │   ├── ConnectionRegistry (local hit)    │   ├── has_node_conn → registry lookup
//!   │   ├── RegionTopology (who to ask)       │   └── open_stream → StreamDispatcher
//!   │   └── PeerClient fan-out  ───────────────▶│       └── bridged to node session
//!   │       └── freshest EstablishedAt wins   │
//!   └── NodeStreams                           └── ConnectionRegistry
//!       ├── local  → StreamDispatcher               └── Session (many streams)
//!       └── remote → TcpPeerClient::open_stream ───▶ Node
//! ```

pub mod context;
pub mod error;
pub mod forward;
pub mod peer;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod stream;
pub mod topology;
pub mod wire;

pub use context::RpcContext;
pub use error::{NodeConnError, NodeConnResult, PeerFailure, PeerFailures, QueryError, SessionError};
pub use forward::NodeStreams;
pub use peer::{NodeConnStatus, PeerClient, TcpPeerClient};
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use router::{ClusterRouter, NodeRoute, RouterConfig};
pub use server::PeerServer;
pub use session::{BoxStream, MemorySession, Session, SessionAcceptor, StreamAcceptor, memory_session};
pub use stream::{StreamDispatcher, StreamHandler, StreamHandlers};
pub use topology::{RegionTopology, StaticTopology};
