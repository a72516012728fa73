//! Frame pipe: the engine's device adapter
//!
//! The embedded TCP engine wants a byte-stream device: `AsyncRead` for
//! frames going in, `AsyncWrite` for frames coming out. The stack speaks
//! channels. This adapter converts between the two, preserving frame
//! boundaries on the read side (one packet per read, with carry-over when
//! the engine's buffer is smaller than the frame) and forwarding each
//! written packet into the shared egress queue.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

pub(crate) struct FramePipe {
    rx: mpsc::Receiver<BytesMut>,
    tx: PollSender<Bytes>,
    carry: Option<BytesMut>,
    carry_pos: usize,
}

impl FramePipe {
    pub(crate) fn new(rx: mpsc::Receiver<BytesMut>, tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            rx,
            tx: PollSender::new(tx),
            carry: None,
            carry_pos: 0,
        }
    }
}

impl AsyncRead for FramePipe {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if let Some(ref frame) = this.carry {
            let remaining = frame.len() - this.carry_pos;
            let n = remaining.min(buf.remaining());
            buf.put_slice(&frame[this.carry_pos..this.carry_pos + n]);
            this.carry_pos += n;
            if this.carry_pos >= frame.len() {
                this.carry = None;
                this.carry_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        match Pin::new(&mut this.rx).poll_recv(cx) {
            Poll::Ready(Some(frame)) => {
                let n = frame.len().min(buf.remaining());
                buf.put_slice(&frame[..n]);
                if n < frame.len() {
                    this.carry = Some(frame);
                    this.carry_pos = n;
                }
                Poll::Ready(Ok(()))
            }
            // Channel gone: EOF, the engine shuts down.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for FramePipe {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match this.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let len = buf.len();
                match this.tx.send_item(Bytes::copy_from_slice(buf)) {
                    Ok(()) => Poll::Ready(Ok(len)),
                    Err(_) => Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "egress queue closed",
                    ))),
                }
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "egress queue closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn preserves_frame_boundaries() {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        let mut pipe = FramePipe::new(in_rx, out_tx);

        in_tx.send(BytesMut::from(&b"frame-one"[..])).await.unwrap();
        in_tx.send(BytesMut::from(&b"frame-two"[..])).await.unwrap();

        let mut buf = [0u8; 32];
        let n = pipe.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"frame-one");
        let n = pipe.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"frame-two");
    }

    #[tokio::test]
    async fn carries_over_partial_reads() {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        let mut pipe = FramePipe::new(in_rx, out_tx);

        in_tx
            .send(BytesMut::from(&b"0123456789"[..]))
            .await
            .unwrap();

        let mut buf = [0u8; 4];
        let n = pipe.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"0123");
        let n = pipe.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"4567");
        let n = pipe.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"89");
    }

    #[tokio::test]
    async fn writes_become_egress_frames() {
        let (_in_tx, in_rx) = mpsc::channel::<BytesMut>(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let mut pipe = FramePipe::new(in_rx, out_tx);

        pipe.write_all(b"\x45egress").await.unwrap();
        let frame = out_rx.recv().await.unwrap();
        assert_eq!(&frame[..], b"\x45egress");
    }

    #[tokio::test]
    async fn closed_input_reads_as_eof() {
        let (in_tx, in_rx) = mpsc::channel::<BytesMut>(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        let mut pipe = FramePipe::new(in_rx, out_tx);
        drop(in_tx);

        let mut buf = [0u8; 8];
        let n = pipe.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
