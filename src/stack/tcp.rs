//! Accepted TCP streams
//!
//! [`TcpFlow`] wraps the embedded engine's per-flow stream with the
//! semantics handlers rely on: a read/write deadline pair and independent
//! half-close of the two directions. It remains a plain
//! `AsyncRead + AsyncWrite` stream, so the relay and any tokio I/O
//! combinators work on it unchanged.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use ipstack::stream::IpStackTcpStream;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};

/// One armed deadline, lazily backed by a timer.
#[derive(Default)]
struct DeadlineGate {
    at: Option<Instant>,
    timer: Option<Pin<Box<Sleep>>>,
}

impl DeadlineGate {
    fn set(&mut self, at: Option<Instant>) {
        self.at = at;
        self.timer = None;
    }

    /// Whether the deadline has passed; registers a wakeup otherwise.
    fn poll_expired(&mut self, cx: &mut Context<'_>) -> bool {
        let Some(at) = self.at else { return false };
        let timer = self
            .timer
            .get_or_insert_with(|| Box::pin(sleep_until(at)));
        timer.as_mut().poll(cx).is_ready()
    }
}

/// An accepted TCP flow.
///
/// Reads observe bytes in sending order; writes feed the engine's send
/// path. After [`TcpFlow::close_read`] reads surface end-of-stream; after
/// the write half is shut down further writes are refused. Dropping the
/// flow closes both halves.
pub struct TcpFlow {
    inner: IpStackTcpStream,
    local: SocketAddr,
    peer: SocketAddr,
    read_deadline: DeadlineGate,
    write_deadline: DeadlineGate,
    read_closed: bool,
    write_closed: bool,
}

impl TcpFlow {
    pub(crate) fn new(inner: IpStackTcpStream) -> Self {
        let local = inner.local_addr();
        let peer = inner.peer_addr();
        Self {
            inner,
            local,
            peer,
            read_deadline: DeadlineGate::default(),
            write_deadline: DeadlineGate::default(),
            read_closed: false,
            write_closed: false,
        }
    }

    /// Host-side endpoint that opened the flow.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Outside destination the flow was addressed to.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Arm or clear the read deadline. A deadline in the past makes every
    /// read fail with [`io::ErrorKind::TimedOut`] until it is advanced.
    pub fn set_read_deadline(&mut self, at: Option<Instant>) {
        self.read_deadline.set(at);
    }

    /// Arm or clear the write deadline.
    pub fn set_write_deadline(&mut self, at: Option<Instant>) {
        self.write_deadline.set(at);
    }

    /// Arm both deadlines at once.
    pub fn set_deadline(&mut self, at: Option<Instant>) {
        self.read_deadline.set(at);
        self.write_deadline.set(at);
    }

    /// Close the receive half: subsequent reads return end-of-stream.
    pub fn close_read(&mut self) {
        self.read_closed = true;
    }

    /// Close the send half, flushing what the engine has buffered.
    /// Equivalent to [`AsyncWriteExt::shutdown`].
    pub async fn close_write(&mut self) -> io::Result<()> {
        self.shutdown().await
    }

    /// Close both halves. Idempotent.
    pub async fn close(&mut self) {
        let _ = self.shutdown().await;
        self.read_closed = true;
    }
}

impl AsyncRead for TcpFlow {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.read_closed {
            return Poll::Ready(Ok(()));
        }
        if this.read_deadline.poll_expired(cx) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "read deadline expired",
            )));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpFlow {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.write_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write half closed",
            )));
        }
        if this.write_deadline.poll_expired(cx) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "write deadline expired",
            )));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.write_closed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.write_closed {
            return Poll::Ready(Ok(()));
        }
        match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Ready(res) => {
                this.write_closed = true;
                Poll::Ready(res)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for TcpFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpFlow")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("read_closed", &self.read_closed)
            .field("write_closed", &self.write_closed)
            .finish()
    }
}
