//! Abstract IP-frame device
//!
//! The gateway core never talks to a TUN interface or a packet-diversion
//! driver directly. It consumes a [`Device`]: something that can hand over
//! one IP frame at a time and accept frames going the other way. Platform
//! construction (TUN fd wrapping, driver handles) lives outside this crate.
//!
//! [`ChannelDevice`] is the in-memory implementation used by the tests and
//! by embedders that already own packet queues (a userspace tunnel, a
//! capture loop).

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::DeviceError;

/// The largest frame the core reads from or writes to a device.
pub const DEFAULT_MTU: usize = 1500;

/// A bidirectional IP-frame source/sink.
///
/// Frames are whole IP packets; the first nibble selects IPv4 or IPv6.
/// Implementations must be safe to drive from separate reader and writer
/// tasks.
#[async_trait]
pub trait Device: Send + Sync {
    /// Receive one IP frame from the host side.
    ///
    /// Blocks until a frame is available. Returns [`DeviceError::Closed`]
    /// once the device has shut down; the inbound pump treats that as the
    /// end of the stack's life.
    async fn recv_frame(&self) -> Result<BytesMut, DeviceError>;

    /// Send one IP frame toward the host side.
    async fn send_frame(&self, frame: Bytes) -> Result<(), DeviceError>;

    /// Send a batch of frames.
    ///
    /// The default implementation loops over [`Device::send_frame`];
    /// devices with a batched syscall path override it.
    async fn send_frames(&self, frames: Vec<Bytes>) -> Result<(), DeviceError> {
        for frame in frames {
            self.send_frame(frame).await?;
        }
        Ok(())
    }

    /// Shut the device down. Pending and future reads fail with
    /// [`DeviceError::Closed`]. Must be idempotent.
    fn close(&self);
}

/// In-memory [`Device`] backed by a pair of bounded channels.
///
/// The gateway side reads what the host side injects and vice versa. Use
/// [`ChannelDevice::new`] to get the device together with its
/// [`DeviceHost`] handle.
pub struct ChannelDevice {
    rx: tokio::sync::Mutex<mpsc::Receiver<BytesMut>>,
    tx: mpsc::Sender<Bytes>,
    mtu: usize,
    closed: CancellationToken,
}

/// Host-side handle of a [`ChannelDevice`].
///
/// Tests and embedders use it to inject frames into the gateway and to
/// collect the frames the gateway emits.
pub struct DeviceHost {
    tx: mpsc::Sender<BytesMut>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    closed: CancellationToken,
}

impl ChannelDevice {
    /// Create a device/host pair with the given queue depth per direction.
    #[must_use]
    pub fn new(depth: usize, mtu: usize) -> (Self, DeviceHost) {
        let (host_tx, gw_rx) = mpsc::channel(depth);
        let (gw_tx, host_rx) = mpsc::channel(depth);
        let closed = CancellationToken::new();
        let device = Self {
            rx: tokio::sync::Mutex::new(gw_rx),
            tx: gw_tx,
            mtu,
            closed: closed.clone(),
        };
        let host = DeviceHost {
            tx: host_tx,
            rx: tokio::sync::Mutex::new(host_rx),
            closed,
        };
        (device, host)
    }
}

#[async_trait]
impl Device for ChannelDevice {
    async fn recv_frame(&self) -> Result<BytesMut, DeviceError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => Err(DeviceError::Closed),
            frame = rx.recv() => frame.ok_or(DeviceError::Closed),
        }
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), DeviceError> {
        if frame.len() > self.mtu {
            return Err(DeviceError::FrameTooLarge {
                len: frame.len(),
                mtu: self.mtu,
            });
        }
        tokio::select! {
            () = self.closed.cancelled() => Err(DeviceError::Closed),
            sent = self.tx.send(frame) => sent.map_err(|_| DeviceError::Closed),
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

impl DeviceHost {
    /// Inject one IP frame as if the host had sent it into the device.
    pub async fn inject(&self, frame: impl Into<BytesMut> + Send) -> Result<(), DeviceError> {
        self.tx
            .send(frame.into())
            .await
            .map_err(|_| DeviceError::Closed)
    }

    /// Next frame the gateway wrote toward the host.
    pub async fn next_frame(&self) -> Result<Bytes, DeviceError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => {
                // Drain what the gateway managed to emit before shutdown.
                match rx.try_recv() {
                    Ok(frame) => Ok(frame),
                    Err(_) => Err(DeviceError::Closed),
                }
            }
            frame = rx.recv() => frame.ok_or(DeviceError::Closed),
        }
    }

    /// Close the device from the host side.
    pub fn close(&self) {
        self.closed.cancel();
    }
}
