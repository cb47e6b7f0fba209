//! Named streams over a node session.
//!
//! The opener writes the method name as a single line on a fresh logical
//! stream. The remote dispatch table answers with `OK` and hands the
//! stream to the handler, or with `ERR <message>` and closes it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use warp_core::config::DEFAULT_STREAM_HANDSHAKE_TIMEOUT as DEFAULT_HANDSHAKE_TIMEOUT;

use crate::error::{NodeConnError, NodeConnResult, SessionError};
use crate::registry::ConnectionHandle;
use crate::session::{BoxStream, StreamAcceptor};
use crate::wire::{read_line, write_line};

/// Longest method name accepted in a stream header.
pub const MAX_METHOD_LEN: usize = 256;

const ACK_OK: &str = "OK";
const ACK_ERR: &str = "ERR ";
const UNKNOWN_METHOD: &str = "unknown rpc method";
const MAX_ACK_LEN: usize = 1024;

fn valid_method(method: &str) -> bool {
    !method.is_empty() && method.len() <= MAX_METHOD_LEN && !method.contains('\n')
}

/// Opens named streams on local node connections.
#[derive(Debug, Clone)]
pub struct StreamDispatcher {
    handshake_timeout: Duration,
}

impl StreamDispatcher {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }

    /// Open a stream on `handle`'s session bound to `method`.
    ///
    /// Fails with `SessionClosed` before touching a dead session, and
    /// with `UnknownMethod` when the node has no handler for `method`.
    /// Opening and the handshake share one timeout, so a node that stops
    /// accepting streams cannot block the caller.
    /// Dropping the returned stream frees its slot; the session stays open.
    pub async fn open_stream(
        &self,
        handle: &ConnectionHandle,
        method: &str,
    ) -> NodeConnResult<BoxStream> {
        if handle.session.is_closed() {
            return Err(NodeConnError::SessionClosed(handle.node_id.clone()));
        }
        if !valid_method(method) {
            return Err(NodeConnError::UnknownMethod(method.to_string()));
        }

        let open = async {
            let mut stream = handle.session.open().await.map_err(|e| match e {
                SessionError::Closed => NodeConnError::SessionClosed(handle.node_id.clone()),
                SessionError::Io(e) => NodeConnError::Io(e),
            })?;
            handshake(&mut stream, method).await?;
            Ok::<_, NodeConnError>(stream)
        };

        match tokio::time::timeout(self.handshake_timeout, open).await {
            Ok(Ok(stream)) => {
                debug!(node_id = %handle.node_id, method, "node stream opened");
                Ok(stream)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(NodeConnError::Handshake(format!(
                "stream not opened within {:?}",
                self.handshake_timeout
            ))),
        }
    }
}

impl Default for StreamDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_HANDSHAKE_TIMEOUT)
    }
}

async fn handshake(stream: &mut BoxStream, method: &str) -> NodeConnResult<()> {
    write_line(stream, method).await?;

    let ack = read_line(stream, MAX_ACK_LEN)
        .await?
        .ok_or_else(|| NodeConnError::Handshake("stream closed before acknowledgement".into()))?;

    if ack == ACK_OK {
        return Ok(());
    }
    match ack.strip_prefix(ACK_ERR) {
        Some(msg) if msg.starts_with(UNKNOWN_METHOD) => {
            Err(NodeConnError::UnknownMethod(method.to_string()))
        }
        Some(msg) => Err(NodeConnError::Handshake(msg.to_string())),
        None => Err(NodeConnError::Handshake(format!("unexpected acknowledgement {ack:?}"))),
    }
}

/// Handler for one named stream method on the accepting side.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, stream: BoxStream);
}

/// Dispatch table for inbound streams, keyed by method name.
pub struct StreamHandlers {
    handlers: HashMap<String, Arc<dyn StreamHandler>>,
    header_timeout: Duration,
}

impl StreamHandlers {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            header_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// How long an inbound stream may take to send its header.
    pub fn with_header_timeout(mut self, timeout: Duration) -> Self {
        self.header_timeout = timeout;
        self
    }

    /// Register `handler` under `method`, replacing any previous one.
    ///
    /// Names that cannot appear in a header are ignored.
    pub fn register(&mut self, method: &str, handler: Arc<dyn StreamHandler>) -> bool {
        if !valid_method(method) {
            warn!(method, "refusing to register invalid stream method");
            return false;
        }
        self.handlers.insert(method.to_string(), handler);
        true
    }

    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.handlers.keys().cloned().collect();
        methods.sort();
        methods
    }

    /// Read the header of one inbound stream and run its handler.
    ///
    /// Unknown methods are reported to the opener and the stream is closed.
    pub async fn dispatch(&self, mut stream: BoxStream) -> NodeConnResult<()> {
        let header = tokio::time::timeout(self.header_timeout, read_line(&mut stream, MAX_METHOD_LEN))
            .await
            .map_err(|_| NodeConnError::Handshake("timed out waiting for stream header".into()))??;
        let method = header
            .ok_or_else(|| NodeConnError::Handshake("stream closed before header".into()))?;

        match self.handlers.get(&method) {
            Some(handler) => {
                write_line(&mut stream, ACK_OK).await?;
                debug!(method, "dispatching inbound stream");
                handler.handle(stream).await;
                Ok(())
            }
            None => {
                let err = NodeConnError::UnknownMethod(method);
                write_line(&mut stream, &format!("{ACK_ERR}{err}")).await?;
                stream.shutdown().await?;
                warn!(error = %err, "rejected inbound stream");
                Err(err)
            }
        }
    }

    /// Serve every stream from `acceptor` until it is exhausted.
    ///
    /// Each stream is dispatched on its own task.
    pub async fn serve<A>(self: Arc<Self>, mut acceptor: A)
    where
        A: StreamAcceptor,
    {
        while let Some(stream) = acceptor.accept().await {
            let handlers = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = handlers.dispatch(stream).await {
                    debug!(error = %e, "inbound stream ended with error");
                }
            });
        }
        debug!("stream acceptor closed");
    }
}

impl Default for StreamHandlers {
    fn default() -> Self {
        Self::new()
    }
}
