//! Error types for tungate
//!
//! Errors are categorized by subsystem, with a top-level [`GatewayError`]
//! aggregating them. The relay and the flow handlers rely on the
//! classification helpers here to tell transient I/O conditions (absorbed,
//! clean termination) from real failures (surfaced, flow closed).

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for the gateway core
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Frame device errors
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Stack lifecycle and pump errors
    #[error("stack error: {0}")]
    Stack(#[from] StackError),

    /// Accepted packet-conn errors
    #[error("udp flow error: {0}")]
    Udp(#[from] UdpError),

    /// Relay copy loop errors
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// DNS hijack errors
    #[error("dns error: {0}")]
    Dns(#[from] DnsError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by [`crate::device::Device`] implementations
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device has been closed; reads and writes can never succeed again
    #[error("device closed")]
    Closed,

    /// A frame exceeded the device MTU
    #[error("frame of {len} bytes exceeds mtu {mtu}")]
    FrameTooLarge { len: usize, mtu: usize },

    /// Underlying transport error
    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Stack construction and lifecycle errors
#[derive(Debug, Error)]
pub enum StackError {
    /// The stack has already been closed
    #[error("stack closed")]
    Closed,

    /// The embedded TCP engine failed
    #[error("tcp engine error: {0}")]
    Engine(String),
}

/// Errors surfaced by accepted packet-conns
#[derive(Debug, Error)]
pub enum UdpError {
    /// The flow was closed; behaves like end-of-stream
    #[error("flow closed")]
    Closed,

    /// A read or write deadline expired
    #[error("deadline expired")]
    TimedOut,

    /// The caller's buffer was too small for the datagram; `copied` bytes
    /// were written and the rest of the payload was discarded
    #[error("datagram truncated to {copied} bytes (from {from})")]
    Truncated { copied: usize, from: SocketAddr },

    /// The operation does not apply to this flow shape
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// The source and destination address families disagree
    #[error("address family mismatch between {src} and {dst}")]
    AddrFamily { src: SocketAddr, dst: SocketAddr },

    /// The egress queue rejected the frame
    #[error("egress unavailable")]
    Egress,
}

impl UdpError {
    /// Transient conditions that end a relay direction cleanly
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        matches!(self, Self::Closed | Self::TimedOut)
    }
}

/// Errors reported by the relay copy loops
#[derive(Debug, Error)]
pub enum RelayError {
    /// A sink accepted zero bytes for a non-empty write
    #[error("short write")]
    ShortWrite,

    /// Non-clean stream error, first of either direction
    #[error("relay I/O error: {0}")]
    Io(#[from] io::Error),

    /// Non-clean packet-conn error, first of either direction
    #[error("relay udp error: {0}")]
    Udp(#[from] UdpError),
}

/// Errors inside the DNS hijack loop
#[derive(Debug, Error)]
pub enum DnsError {
    /// The query could not be decoded
    #[error("dns parse error: {0}")]
    Parse(String),

    /// The response could not be encoded
    #[error("dns encode error: {0}")]
    Encode(String),

    /// The fallback resolver failed
    #[error("resolver error: {0}")]
    Resolver(#[source] io::Error),

    /// A fake mapping pointed outside the configured range
    #[error("fake ip {0} outside configured range")]
    OutOfRange(std::net::Ipv4Addr),

    /// The underlying packet-conn failed
    #[error("dns conn error: {0}")]
    Conn(#[from] UdpError),
}

/// Classify an I/O error as a clean termination of a relay direction.
///
/// Timeouts, closed pipes and truncated streams mean the peer went away or
/// lost interest; the relay treats those as end-of-stream rather than
/// failures.
#[must_use]
pub fn is_clean_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}
