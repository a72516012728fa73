//! Egress routes for accepted packet-conns
//!
//! A [`Route`] is the context needed to push one UDP datagram back toward
//! the host: the outside address the frame claims as its source, the host
//! endpoint it is delivered to, and a handle on the stack's egress queue.
//! Frame assembly follows the on-wire rules: the UDP checksum is left zero
//! on IPv4 (RFC 768 permits it) and always computed on IPv6 (RFC 2460
//! section 8.1 requires it).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};

use bytes::Bytes;
use smoltcp::wire::{IpAddress, IpProtocol, Ipv4Packet, Ipv6Packet, UdpPacket};
use tokio::sync::mpsc;

use crate::error::UdpError;

use super::FlowId;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;
const DEFAULT_TTL: u8 = 64;

/// Egress context for one (host endpoint, outside endpoint) pair.
#[derive(Clone)]
pub(crate) struct Route {
    /// Outside endpoint used as the frame source.
    pub peer: SocketAddr,
    /// Host endpoint the frame is delivered to.
    pub local: SocketAddr,
    egress: mpsc::Sender<Bytes>,
}

impl Route {
    pub(crate) fn new(id: FlowId, egress: mpsc::Sender<Bytes>) -> Self {
        Self {
            peer: id.peer,
            local: id.local,
            egress,
        }
    }

    /// Same route with the outside (source) endpoint replaced.
    pub(crate) fn rewrite_peer(&self, peer: SocketAddr) -> Self {
        Self {
            peer,
            local: self.local,
            egress: self.egress.clone(),
        }
    }

    /// Same route with the host (destination) endpoint replaced.
    pub(crate) fn rewrite_local(&self, local: SocketAddr) -> Self {
        Self {
            peer: self.peer,
            local,
            egress: self.egress.clone(),
        }
    }

    /// Encapsulate `payload` as `peer -> local` and submit it for egress.
    pub(crate) async fn send(&self, payload: &[u8]) -> Result<(), UdpError> {
        let frame = build_udp_frame(self.peer, self.local, payload)?;
        self.egress.send(frame).await.map_err(|_| UdpError::Egress)
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Route({} -> {})", self.peer, self.local)
    }
}

fn next_ident() -> u16 {
    static IDENT: AtomicU16 = AtomicU16::new(1);
    IDENT.fetch_add(1, Ordering::Relaxed)
}

/// Build a raw IP frame carrying one UDP datagram from `src` to `dst`.
pub(crate) fn build_udp_frame(
    src: SocketAddr,
    dst: SocketAddr,
    payload: &[u8],
) -> Result<Bytes, UdpError> {
    match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            Ok(build_udp_v4(s, src.port(), d, dst.port(), payload))
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            Ok(build_udp_v6(s, src.port(), d, dst.port(), payload))
        }
        _ => Err(UdpError::AddrFamily { src, dst }),
    }
}

fn build_udp_v4(
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> Bytes {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    let mut buf = vec![0u8; total_len];
    let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
    ip.set_version(4);
    ip.set_header_len(IPV4_HEADER_LEN as u8);
    ip.set_dscp(0);
    ip.set_ecn(0);
    ip.set_total_len(total_len as u16);
    ip.set_ident(next_ident());
    ip.set_more_frags(false);
    ip.set_dont_frag(true);
    ip.set_frag_offset(0);
    ip.set_hop_limit(DEFAULT_TTL);
    ip.set_next_header(IpProtocol::Udp);
    ip.set_src_addr(src);
    ip.set_dst_addr(dst);
    {
        let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
        udp.set_src_port(src_port);
        udp.set_dst_port(dst_port);
        udp.set_len(udp_len as u16);
        udp.payload_mut()[..payload.len()].copy_from_slice(payload);
        // Zero checksum: transmitter skipped generation (RFC 768).
        udp.set_checksum(0);
    }
    ip.fill_checksum();
    Bytes::from(buf)
}

fn build_udp_v6(
    src: Ipv6Addr,
    src_port: u16,
    dst: Ipv6Addr,
    dst_port: u16,
    payload: &[u8],
) -> Bytes {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let mut buf = vec![0u8; IPV6_HEADER_LEN + udp_len];
    let mut ip = Ipv6Packet::new_unchecked(&mut buf[..]);
    ip.set_version(6);
    ip.set_traffic_class(0);
    ip.set_flow_label(0);
    ip.set_payload_len(udp_len as u16);
    ip.set_next_header(IpProtocol::Udp);
    ip.set_hop_limit(DEFAULT_TTL);
    ip.set_src_addr(src);
    ip.set_dst_addr(dst);
    {
        let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
        udp.set_src_port(src_port);
        udp.set_dst_port(dst_port);
        udp.set_len(udp_len as u16);
        udp.payload_mut()[..payload.len()].copy_from_slice(payload);
        udp.fill_checksum(&IpAddress::Ipv6(src), &IpAddress::Ipv6(dst));
    }
    Bytes::from(buf)
}
