//! Cross-server routing integration tests.
//!
//! Each test starts several peer servers in-process on loopback TCP
//! listeners, attaches nodes to some of them through in-memory sessions,
//! and then resolves or streams to those nodes from another server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use warp_core::{EstablishedAt, NodeId, ServerMember};
use warpgrid_nodeconn::{
    BoxStream, ClusterRouter, ConnectionHandle, ConnectionRegistry, NodeConnError, NodeStreams,
    PeerServer, RouterConfig, RpcContext, StaticTopology, StreamDispatcher, StreamHandler,
    StreamHandlers, TcpPeerClient, memory_session,
};

struct Echo;

#[async_trait]
impl StreamHandler for Echo {
    async fn handle(&self, mut stream: BoxStream) {
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

/// A running peer server and its registry.
struct TestServer {
    member: ServerMember,
    registry: ConnectionRegistry,
    _shutdown: watch::Sender<bool>,
}

impl TestServer {
    async fn start(name: &str, region: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let member = ServerMember::new(name, region, listener.local_addr().unwrap());
        let registry = ConnectionRegistry::new();
        let server = Arc::new(PeerServer::new(
            member.clone(),
            registry.clone(),
            StreamDispatcher::default(),
        ));
        let (tx, rx) = watch::channel(false);
        tokio::spawn(server.serve(listener, rx));
        Self {
            member,
            registry,
            _shutdown: tx,
        }
    }

    /// Attach node `id` with an `Echo` handler, connected at `at`.
    fn connect_node(&self, id: &str, at: u64) -> u64 {
        let (session, acceptor) = memory_session(16 * 1024);
        let mut handlers = StreamHandlers::new();
        handlers.register("Echo", Arc::new(Echo));
        tokio::spawn(Arc::new(handlers).serve(acceptor));

        let handle = ConnectionHandle::new(
            NodeId::from(id),
            "10.1.0.1:4647".parse().unwrap(),
            Arc::new(session),
        )
        .with_established_at(EstablishedAt::from_nanos(at));
        let conn_id = handle.conn_id;
        self.registry.add(handle);
        conn_id
    }
}

/// An address with nothing listening on it.
async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn router_for(
    local: &TestServer,
    regions: &[(&str, Vec<ServerMember>)],
) -> Arc<ClusterRouter> {
    let topology = StaticTopology::new(local.member.region.clone());
    for (region, servers) in regions {
        topology.set_region(region, servers.clone());
    }
    let config = RouterConfig {
        query_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    Arc::new(ClusterRouter::new(
        local.member.clone(),
        local.registry.clone(),
        Arc::new(topology),
        Arc::new(TcpPeerClient::new().with_connect_timeout(Duration::from_millis(500))),
        config,
    ))
}

fn streams_for(router: Arc<ClusterRouter>) -> NodeStreams {
    NodeStreams::new(router, StreamDispatcher::default(), TcpPeerClient::new())
}

async fn echo_round_trip(stream: &mut BoxStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn no_path_anywhere() {
    let a = TestServer::start("a", "global").await;
    let b = TestServer::start("b", "global").await;
    let c = TestServer::start("c", "global").await;
    let router = router_for(&a, &[("global", vec![a.member.clone(), b.member.clone(), c.member.clone()])]);

    let err = router.resolve(&NodeId::from("n1"), "global").await.unwrap_err();
    assert!(matches!(err, NodeConnError::NoConnection(_)));
    assert!(err.to_string().contains("no path to node"));
}

#[tokio::test]
async fn no_path_to_unknown_region() {
    let a = TestServer::start("a", "global").await;
    let router = router_for(&a, &[("global", vec![a.member.clone()])]);

    let err = router.resolve(&NodeId::from("n1"), "mars").await.unwrap_err();
    assert!(matches!(err, NodeConnError::RegionUnknown(_)));
    assert!(err.to_string().contains("no path to region"));
}

#[tokio::test]
async fn path_through_peer() {
    let a = TestServer::start("a", "global").await;
    let b = TestServer::start("b", "global").await;
    b.connect_node("n1", 10);
    let router = router_for(&a, &[("global", vec![a.member.clone(), b.member.clone()])]);

    let route = router.resolve(&NodeId::from("n1"), "global").await.unwrap();
    assert!(!route.is_local());
    assert_eq!(route.addr(), b.member.rpc_addr);
    assert_eq!(route.established_at(), EstablishedAt::from_nanos(10));
}

#[tokio::test]
async fn path_in_other_region() {
    let a = TestServer::start("a", "global").await;
    let eu = TestServer::start("eu-1", "eu").await;
    eu.connect_node("n1", 10);
    let router = router_for(
        &a,
        &[("global", vec![a.member.clone()]), ("eu", vec![eu.member.clone()])],
    );

    let route = router.resolve(&NodeId::from("n1"), "eu").await.unwrap();
    assert_eq!(route.server().name, "eu-1");

    let ctx = RpcContext::new(NodeId::from("n1"), "eu", "global");
    assert_eq!(router.route(&ctx).await.unwrap().addr(), eu.member.rpc_addr);
}

#[tokio::test]
async fn newest_connection_wins() {
    let a = TestServer::start("a", "global").await;
    let b = TestServer::start("b", "global").await;
    let c = TestServer::start("c", "global").await;
    b.connect_node("n1", 10);
    c.connect_node("n1", 20);
    let router = router_for(&a, &[("global", vec![a.member.clone(), b.member.clone(), c.member.clone()])]);

    let route = router.resolve(&NodeId::from("n1"), "global").await.unwrap();
    assert_eq!(route.addr(), c.member.rpc_addr);
}

#[tokio::test]
async fn path_found_despite_unreachable_peer() {
    let a = TestServer::start("a", "global").await;
    let b = TestServer::start("b", "global").await;
    b.connect_node("n1", 10);
    let gone = ServerMember::new("gone", "global", dead_addr().await);
    let router = router_for(&a, &[("global", vec![a.member.clone(), b.member.clone(), gone])]);

    let route = router.resolve(&NodeId::from("n1"), "global").await.unwrap();
    assert_eq!(route.addr(), b.member.rpc_addr);
}

#[tokio::test]
async fn no_path_with_unreachable_peer_is_query_failure() {
    let a = TestServer::start("a", "global").await;
    let b = TestServer::start("b", "global").await;
    let gone = ServerMember::new("gone", "global", dead_addr().await);
    let router = router_for(&a, &[("global", vec![a.member.clone(), b.member.clone(), gone])]);

    let err = router.resolve(&NodeId::from("n1"), "global").await.unwrap_err();
    match &err {
        NodeConnError::QueryFailed { failures, .. } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures.iter().next().unwrap().server.name, "gone");
        }
        other => panic!("expected QueryFailed, got {other:?}"),
    }
    assert!(err.to_string().contains("failed querying"));
}

#[tokio::test]
async fn reconnect_moves_node_to_new_server() {
    let a = TestServer::start("a", "global").await;
    let b = TestServer::start("b", "global").await;
    let c = TestServer::start("c", "global").await;
    let router = router_for(&a, &[("global", vec![a.member.clone(), b.member.clone(), c.member.clone()])]);
    let n1 = NodeId::from("n1");

    let old_conn = b.connect_node("n1", 10);
    assert_eq!(router.resolve(&n1, "global").await.unwrap().addr(), b.member.rpc_addr);

    // Node reconnects to c while b still lists it.
    c.connect_node("n1", 20);
    assert_eq!(router.resolve(&n1, "global").await.unwrap().addr(), c.member.rpc_addr);

    assert!(b.registry.remove_if_current(&n1, old_conn));
    assert_eq!(router.resolve(&n1, "global").await.unwrap().addr(), c.member.rpc_addr);
}

#[tokio::test]
async fn local_node_stream() {
    let a = TestServer::start("a", "global").await;
    a.connect_node("n1", 10);
    let streams = streams_for(router_for(&a, &[("global", vec![a.member.clone()])]));

    let ctx = RpcContext::local(NodeId::from("n1"), "global");
    let mut stream = streams.open(&ctx, "Echo").await.unwrap();
    assert_eq!(echo_round_trip(&mut stream, b"hello").await, b"hello");
}

#[tokio::test]
async fn forwarded_node_stream() {
    let a = TestServer::start("a", "global").await;
    let b = TestServer::start("b", "global").await;
    b.connect_node("n1", 10);
    let streams = streams_for(router_for(&a, &[("global", vec![a.member.clone(), b.member.clone()])]));

    let ctx = RpcContext::local(NodeId::from("n1"), "global");
    let mut stream = streams.open(&ctx, "Echo").await.unwrap();
    assert_eq!(echo_round_trip(&mut stream, b"through b").await, b"through b");
    assert_eq!(echo_round_trip(&mut stream, b"again").await, b"again");
}

#[tokio::test]
async fn forwarded_stream_to_bad_endpoint() {
    let a = TestServer::start("a", "global").await;
    let b = TestServer::start("b", "global").await;
    b.connect_node("n1", 10);
    let streams = streams_for(router_for(&a, &[("global", vec![a.member.clone(), b.member.clone()])]));

    let ctx = RpcContext::local(NodeId::from("n1"), "global");
    let err = match streams.open(&ctx, "Bogus").await {
        Ok(_) => panic!("stream to unknown method should fail"),
        Err(e) => e,
    };
    assert!(matches!(err, NodeConnError::UnknownMethod(ref m) if m == "Bogus"));
    assert!(err.to_string().contains("unknown rpc method"));
}

#[tokio::test]
async fn local_stream_to_bad_endpoint() {
    let a = TestServer::start("a", "global").await;
    a.connect_node("n1", 10);
    let streams = streams_for(router_for(&a, &[("global", vec![a.member.clone()])]));

    let ctx = RpcContext::local(NodeId::from("n1"), "global");
    let err = match streams.open(&ctx, "Bogus").await {
        Ok(_) => panic!("stream to unknown method should fail"),
        Err(e) => e,
    };
    assert!(matches!(err, NodeConnError::UnknownMethod(_)));
}
