//! Bidirectional relay between an accepted flow and an upstream endpoint
//!
//! [`relay`] couples two duplex byte streams with half-close semantics:
//! when one side's read reaches end-of-stream the other side's write half
//! is flushed and shut down, while the opposite direction keeps running.
//! The peer can therefore keep sending after the host half-closes, and
//! vice versa.
//!
//! Error policy: transient conditions (timeouts, closed pipes, reset
//! peers) terminate the relay cleanly and are not reported. Anything else
//! terminates both directions immediately and surfaces as the relay's
//! result; the caller closes both endpoints, which dropping them does.
//! A sink that accepts zero bytes of a non-empty write is a
//! [`RelayError::ShortWrite`].
//!
//! Backpressure is the copy loop itself: each direction stages through one
//! fixed buffer and never reads ahead of its writer.

pub mod udp;

pub use udp::{relay_datagrams, OutboundDatagram, UDP_RELAY_IDLE};

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{is_clean_io, RelayError};

/// Staging buffer per direction.
pub const RELAY_BUFFER_SIZE: usize = 4096;

/// Byte counts after both directions settled.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayResult {
    /// Bytes copied from the accepted flow to the upstream endpoint
    pub to_remote: u64,
    /// Bytes copied from the upstream endpoint to the accepted flow
    pub to_local: u64,
}

impl RelayResult {
    /// Total bytes moved in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.to_remote + self.to_local
    }
}

/// State for one direction of transfer.
struct TransferState {
    buf: Box<[u8]>,
    read_done: bool,
    write_done: bool,
    pos: usize,
    cap: usize,
    transferred: u64,
}

impl TransferState {
    fn new(buf_size: usize) -> Self {
        Self {
            buf: vec![0u8; buf_size].into_boxed_slice(),
            read_done: false,
            write_done: false,
            pos: 0,
            cap: 0,
            transferred: 0,
        }
    }

    fn poll_transfer<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            if self.pos < self.cap {
                let n = match writer.as_mut().poll_write(cx, &self.buf[self.pos..self.cap]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "sink accepted zero bytes",
                        )));
                    }
                    Poll::Ready(Ok(n)) => n,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                };
                self.pos += n;
                self.transferred += n as u64;
                if self.pos == self.cap {
                    self.pos = 0;
                    self.cap = 0;
                }
            } else if self.read_done {
                // Source hit end-of-stream: propagate the half-close by
                // flushing and shutting down the sink's write half.
                if !self.write_done {
                    match writer.as_mut().poll_flush(cx) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    match writer.as_mut().poll_shutdown(cx) {
                        Poll::Ready(Ok(())) => self.write_done = true,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                return Poll::Ready(Ok(()));
            } else {
                let mut read_buf = ReadBuf::new(&mut self.buf);
                match reader.as_mut().poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.cap = n;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
    }

    fn settled(&self) -> bool {
        self.read_done && self.write_done && self.pos == self.cap
    }
}

struct Relay<'a, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    local: &'a mut A,
    remote: &'a mut B,
    up: TransferState,
    down: TransferState,
}

impl<A, B> Future for Relay<'_, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    type Output = Result<RelayResult, RelayError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if !this.up.settled() {
            match this
                .up
                .poll_transfer(cx, Pin::new(&mut *this.local), Pin::new(&mut *this.remote))
            {
                Poll::Ready(Ok(())) | Poll::Pending => {}
                Poll::Ready(Err(e)) => {
                    let result = RelayResult {
                        to_remote: this.up.transferred,
                        to_local: this.down.transferred,
                    };
                    return Poll::Ready(finish(result, e));
                }
            }
        }

        if !this.down.settled() {
            match this
                .down
                .poll_transfer(cx, Pin::new(&mut *this.remote), Pin::new(&mut *this.local))
            {
                Poll::Ready(Ok(())) | Poll::Pending => {}
                Poll::Ready(Err(e)) => {
                    let result = RelayResult {
                        to_remote: this.up.transferred,
                        to_local: this.down.transferred,
                    };
                    return Poll::Ready(finish(result, e));
                }
            }
        }

        if this.up.settled() && this.down.settled() {
            Poll::Ready(Ok(RelayResult {
                to_remote: this.up.transferred,
                to_local: this.down.transferred,
            }))
        } else {
            Poll::Pending
        }
    }
}

/// Map a direction error to the relay's outcome.
///
/// Clean classes settle the whole relay successfully; everything else is
/// the reported error. Either way the relay stops at once and the caller
/// tears both endpoints down.
fn finish(result: RelayResult, err: io::Error) -> Result<RelayResult, RelayError> {
    if is_clean_io(&err) {
        return Ok(result);
    }
    if err.kind() == io::ErrorKind::WriteZero {
        return Err(RelayError::ShortWrite);
    }
    Err(RelayError::Io(err))
}

/// Relay bytes between `local` (the accepted flow) and `remote` (the
/// upstream endpoint) until both directions settle.
pub async fn relay<A, B>(local: &mut A, remote: &mut B) -> Result<RelayResult, RelayError>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    relay_with_buffer(local, remote, RELAY_BUFFER_SIZE).await
}

/// [`relay`] with a custom staging buffer size per direction.
pub async fn relay_with_buffer<A, B>(
    local: &mut A,
    remote: &mut B,
    buf_size: usize,
) -> Result<RelayResult, RelayError>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    Relay {
        local,
        remote,
        up: TransferState::new(buf_size),
        down: TransferState::new(buf_size),
    }
    .await
}
