//! Datagram relay between an accepted packet-conn and a real socket
//!
//! The UDP analogue of the stream relay: one pump per direction between a
//! [`UdpFlow`] and an [`OutboundDatagram`] (normally a
//! [`tokio::net::UdpSocket`]). Each direction applies a per-read idle
//! deadline; hitting it ends that direction cleanly. Whichever direction
//! finishes first closes the flow, which unblocks the other.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{is_clean_io, RelayError, UdpError};
use crate::nat::flow::UdpFlow;

/// Idle deadline applied to every read in both directions.
pub const UDP_RELAY_IDLE: Duration = Duration::from_secs(60);

/// Staging buffer per direction; larger than any unfragmented datagram
/// the stack will deliver.
pub const UDP_RELAY_BUFFER: usize = 4096;

/// A remote datagram endpoint the relay can pump against.
#[async_trait]
pub trait OutboundDatagram: Send + Sync {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl OutboundDatagram for tokio::net::UdpSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        tokio::net::UdpSocket::send_to(self, buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        tokio::net::UdpSocket::recv_from(self, buf).await
    }
}

/// Pump datagrams between `flow` and `outbound` until both directions go
/// idle or fail. The flow is closed on return.
pub async fn relay_datagrams<O>(
    flow: &UdpFlow,
    outbound: &O,
    idle: Duration,
) -> Result<(), RelayError>
where
    O: OutboundDatagram + ?Sized,
{
    let up = async {
        // Accepted flow -> outbound socket.
        let mut buf = vec![0u8; UDP_RELAY_BUFFER];
        let result = loop {
            flow.set_read_deadline(Some(Instant::now() + idle));
            match flow.recv_from(&mut buf).await {
                Ok((n, target)) => {
                    if let Err(e) = outbound.send_to(&buf[..n], target).await {
                        if is_clean_io(&e) {
                            break Ok(());
                        }
                        break Err(RelayError::Io(e));
                    }
                }
                Err(UdpError::Truncated { copied, from }) => {
                    debug!(copied, %from, "oversized datagram dropped");
                }
                Err(e) if e.is_clean() => break Ok(()),
                Err(e) => break Err(RelayError::Udp(e)),
            }
        };
        flow.close();
        result
    };

    let down = async {
        // Outbound socket -> accepted flow.
        let mut buf = vec![0u8; UDP_RELAY_BUFFER];
        let result = loop {
            let recv = tokio::time::timeout(idle, outbound.recv_from(&mut buf));
            tokio::select! {
                () = flow.closed() => break Ok(()),
                recv = recv => match recv {
                    Err(_) => break Ok(()),
                    Ok(Err(e)) if is_clean_io(&e) => break Ok(()),
                    Ok(Err(e)) => break Err(RelayError::Io(e)),
                    Ok(Ok((n, from))) => match flow.send_from(&buf[..n], from).await {
                        Ok(_) => {}
                        Err(e) if e.is_clean() => break Ok(()),
                        Err(e) => break Err(RelayError::Udp(e)),
                    },
                },
            }
        };
        flow.close();
        result
    };

    let (up, down) = tokio::join!(up, down);
    up.and(down)
}
