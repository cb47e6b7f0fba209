//! Multiplexed session capability.
//!
//! A node connection is one physical transport carrying many independent
//! logical streams. Routing code depends only on the [`Session`] trait;
//! the concrete multiplexer is whatever transport accepted the node.
//!
//! [`memory_session`] provides an in-process multiplexer built on
//! `tokio::io::duplex` pairs. It backs embedded agents and tests.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::SessionError;

/// A bidirectional byte stream usable behind a trait object.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> StreamIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// An owned logical stream.
pub type BoxStream = Box<dyn StreamIo>;

/// A session that can open new logical streams.
///
/// Opening a stream never affects other streams on the same session.
#[async_trait]
pub trait Session: Send + Sync {
    /// Open a new logical stream.
    async fn open(&self) -> Result<BoxStream, SessionError>;

    /// Whether the underlying transport has gone away.
    fn is_closed(&self) -> bool;
}

/// Source of inbound logical streams on the accepting side of a session.
#[async_trait]
pub trait StreamAcceptor: Send {
    /// Next inbound stream, or `None` once the session is closed.
    async fn accept(&mut self) -> Option<BoxStream>;
}

/// Pending inbound streams buffered before the acceptor picks them up.
pub(crate) const ACCEPT_BACKLOG: usize = 64;

/// Create an in-process session pair.
///
/// `buffer` is the per-direction byte capacity of each stream.
pub fn memory_session(buffer: usize) -> (MemorySession, SessionAcceptor) {
    let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
    let session = MemorySession {
        tx: Mutex::new(Some(tx)),
        active: Arc::new(AtomicUsize::new(0)),
        buffer,
    };
    (session, SessionAcceptor { rx })
}

/// Opening side of an in-process session.
pub struct MemorySession {
    tx: Mutex<Option<mpsc::Sender<DuplexStream>>>,
    active: Arc<AtomicUsize>,
    buffer: usize,
}

impl MemorySession {
    /// Close the session. Streams already open keep working until dropped.
    pub fn close(&self) {
        let mut tx = self.tx.lock().expect("session lock");
        if tx.take().is_some() {
            debug!("memory session closed");
        }
    }

    /// Logical streams opened on this side and not yet dropped.
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn sender(&self) -> Option<mpsc::Sender<DuplexStream>> {
        let tx = self.tx.lock().expect("session lock");
        tx.as_ref().filter(|tx| !tx.is_closed()).cloned()
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn open(&self) -> Result<BoxStream, SessionError> {
        let tx = self.sender().ok_or(SessionError::Closed)?;
        let (local, remote) = tokio::io::duplex(self.buffer);
        tx.send(remote).await.map_err(|_| SessionError::Closed)?;

        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryStream {
            inner: local,
            _slot: StreamSlot(Arc::clone(&self.active)),
        }))
    }

    fn is_closed(&self) -> bool {
        self.sender().is_none()
    }
}

/// Accepting side of an in-process session.
pub struct SessionAcceptor {
    rx: mpsc::Receiver<DuplexStream>,
}

impl SessionAcceptor {
    /// Stop accepting. The opening side observes the session as closed.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[async_trait]
impl StreamAcceptor for SessionAcceptor {
    async fn accept(&mut self) -> Option<BoxStream> {
        let stream = self.rx.recv().await?;
        Some(Box::new(stream))
    }
}

/// Releases a stream slot when the stream is dropped.
struct StreamSlot(Arc<AtomicUsize>);

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemoryStream {
    inner: DuplexStream,
    _slot: StreamSlot,
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
