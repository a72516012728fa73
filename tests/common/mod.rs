//! Shared harness for driving a whole stack through the channel device
//! with hand-built IP frames.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket};
use tungate::device::DeviceHost;

pub const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Opt-in logging for debugging: `RUST_LOG=tungate=trace cargo test`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One parsed UDP datagram pulled off the device.
#[derive(Debug)]
pub struct UdpReply {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload: Vec<u8>,
    /// The whole IP frame, for header-level assertions.
    pub raw: Vec<u8>,
}

fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn transport_checksum_v4(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, segment: &[u8]) -> u16 {
    let mut pseudo = Vec::with_capacity(12 + segment.len());
    pseudo.extend_from_slice(&src.octets());
    pseudo.extend_from_slice(&dst.octets());
    pseudo.push(0);
    pseudo.push(proto);
    pseudo.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    pseudo.extend_from_slice(segment);
    checksum(&pseudo)
}

fn ipv4_header(buf: &mut [u8], src: Ipv4Addr, dst: Ipv4Addr, proto: u8, total_len: usize) {
    buf[0] = 0x45;
    buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buf[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // don't fragment
    buf[8] = 64;
    buf[9] = proto;
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());
    let cksum = checksum(&buf[..20]);
    buf[10..12].copy_from_slice(&cksum.to_be_bytes());
}

fn v4(addr: SocketAddr) -> (Ipv4Addr, u16) {
    match addr.ip() {
        IpAddr::V4(ip) => (ip, addr.port()),
        IpAddr::V6(_) => panic!("expected an IPv4 address"),
    }
}

/// Build an IPv4 UDP frame `src -> dst`.
pub fn udp_frame_v4(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let (src_ip, src_port) = v4(src);
    let (dst_ip, dst_port) = v4(dst);
    let udp_len = 8 + payload.len();
    let total_len = 20 + udp_len;
    let mut frame = vec![0u8; total_len];
    ipv4_header(&mut frame, src_ip, dst_ip, 17, total_len);
    frame[20..22].copy_from_slice(&src_port.to_be_bytes());
    frame[22..24].copy_from_slice(&dst_port.to_be_bytes());
    frame[24..26].copy_from_slice(&(udp_len as u16).to_be_bytes());
    frame[28..].copy_from_slice(payload);
    let cksum = transport_checksum_v4(src_ip, dst_ip, 17, &frame[20..]);
    frame[26..28].copy_from_slice(&cksum.to_be_bytes());
    frame
}

/// Build an IPv6 UDP frame `src -> dst`.
pub fn udp_frame_v6(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) = (src.ip(), dst.ip()) else {
        panic!("expected IPv6 addresses");
    };
    let udp_len = 8 + payload.len();
    let mut frame = vec![0u8; 40 + udp_len];
    frame[0] = 0x60;
    frame[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    frame[6] = 17;
    frame[7] = 64;
    frame[8..24].copy_from_slice(&src_ip.octets());
    frame[24..40].copy_from_slice(&dst_ip.octets());
    frame[40..42].copy_from_slice(&src.port().to_be_bytes());
    frame[42..44].copy_from_slice(&dst.port().to_be_bytes());
    frame[44..46].copy_from_slice(&(udp_len as u16).to_be_bytes());
    frame[48..].copy_from_slice(payload);

    let mut pseudo = Vec::with_capacity(40 + udp_len);
    pseudo.extend_from_slice(&src_ip.octets());
    pseudo.extend_from_slice(&dst_ip.octets());
    pseudo.extend_from_slice(&(udp_len as u32).to_be_bytes());
    pseudo.extend_from_slice(&[0, 0, 0, 17]);
    pseudo.extend_from_slice(&frame[40..]);
    let cksum = checksum(&pseudo);
    frame[46..48].copy_from_slice(&cksum.to_be_bytes());
    frame
}

/// Parse a frame the gateway emitted as a UDP datagram.
pub fn parse_udp_reply(frame: &[u8]) -> Option<UdpReply> {
    match frame.first().map(|b| b >> 4)? {
        4 => {
            let ip = Ipv4Packet::new_checked(frame).ok()?;
            if ip.next_header() != IpProtocol::Udp {
                return None;
            }
            let udp = UdpPacket::new_checked(ip.payload()).ok()?;
            Some(UdpReply {
                src: SocketAddr::new(ip.src_addr().into(), udp.src_port()),
                dst: SocketAddr::new(ip.dst_addr().into(), udp.dst_port()),
                payload: udp.payload().to_vec(),
                raw: frame.to_vec(),
            })
        }
        6 => {
            let ip = Ipv6Packet::new_checked(frame).ok()?;
            if ip.next_header() != IpProtocol::Udp {
                return None;
            }
            let udp = UdpPacket::new_checked(ip.payload()).ok()?;
            Some(UdpReply {
                src: SocketAddr::new(ip.src_addr().into(), udp.src_port()),
                dst: SocketAddr::new(ip.dst_addr().into(), udp.dst_port()),
                payload: udp.payload().to_vec(),
                raw: frame.to_vec(),
            })
        }
        _ => None,
    }
}

/// Next UDP datagram the gateway emits, skipping other frames.
pub async fn next_udp_reply(host: &DeviceHost) -> UdpReply {
    loop {
        let frame = tokio::time::timeout(FRAME_TIMEOUT, host.next_frame())
            .await
            .expect("timed out waiting for a frame")
            .expect("device closed");
        if let Some(reply) = parse_udp_reply(&frame) {
            return reply;
        }
    }
}

// ---------------------------------------------------------------------------
// Minimal TCP client driven through raw frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct TcpFlags {
    syn: bool,
    ack: bool,
    fin: bool,
    psh: bool,
}

fn tcp_frame_v4(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
    mss: Option<u16>,
) -> Vec<u8> {
    let (src_ip, src_port) = v4(src);
    let (dst_ip, dst_port) = v4(dst);
    let opts_len = if mss.is_some() { 4 } else { 0 };
    let tcp_len = 20 + opts_len + payload.len();
    let total_len = 20 + tcp_len;
    let mut frame = vec![0u8; total_len];
    ipv4_header(&mut frame, src_ip, dst_ip, 6, total_len);

    let t = 20;
    frame[t..t + 2].copy_from_slice(&src_port.to_be_bytes());
    frame[t + 2..t + 4].copy_from_slice(&dst_port.to_be_bytes());
    frame[t + 4..t + 8].copy_from_slice(&seq.to_be_bytes());
    frame[t + 8..t + 12].copy_from_slice(&ack.to_be_bytes());
    frame[t + 12] = (((20 + opts_len) / 4) as u8) << 4;
    let mut flag_byte = 0u8;
    if flags.fin {
        flag_byte |= 0x01;
    }
    if flags.syn {
        flag_byte |= 0x02;
    }
    if flags.psh {
        flag_byte |= 0x08;
    }
    if flags.ack {
        flag_byte |= 0x10;
    }
    frame[t + 13] = flag_byte;
    frame[t + 14..t + 16].copy_from_slice(&65535u16.to_be_bytes());
    if let Some(mss) = mss {
        frame[t + 20] = 2;
        frame[t + 21] = 4;
        frame[t + 22..t + 24].copy_from_slice(&mss.to_be_bytes());
    }
    frame[t + 20 + opts_len..].copy_from_slice(payload);
    let cksum = transport_checksum_v4(src_ip, dst_ip, 6, &frame[t..]);
    frame[t + 16..t + 18].copy_from_slice(&cksum.to_be_bytes());
    frame
}

/// A hand-driven TCP endpoint: enough state machine to handshake, move
/// data both ways, half-close and observe the peer's FIN.
pub struct TcpClient<'a> {
    host: &'a DeviceHost,
    local: SocketAddr,
    peer: SocketAddr,
    snd_nxt: u32,
    rcv_nxt: u32,
    received: VecDeque<u8>,
    peer_fin: bool,
}

impl<'a> TcpClient<'a> {
    /// Perform the three-way handshake.
    pub async fn connect(host: &'a DeviceHost, local: SocketAddr, peer: SocketAddr) -> Self {
        let iss = 0x1000_0000u32;
        let syn = tcp_frame_v4(
            local,
            peer,
            iss,
            0,
            TcpFlags {
                syn: true,
                ..TcpFlags::default()
            },
            &[],
            Some(1460),
        );
        host.inject(&syn[..]).await.unwrap();

        let mut client = Self {
            host,
            local,
            peer,
            snd_nxt: iss.wrapping_add(1),
            rcv_nxt: 0,
            received: VecDeque::new(),
            peer_fin: false,
        };

        loop {
            let frame = tokio::time::timeout(FRAME_TIMEOUT, host.next_frame())
                .await
                .expect("timed out waiting for syn-ack")
                .expect("device closed");
            let Some((seq, _ack, flags, _payload)) = client.parse_segment(&frame) else {
                continue;
            };
            assert!(!flags_rst(&frame), "connection refused");
            if flags.syn && flags.ack {
                client.rcv_nxt = seq.wrapping_add(1);
                client.send_ack().await;
                return client;
            }
        }
    }

    fn parse_segment(&self, frame: &[u8]) -> Option<(u32, u32, TcpFlags, Vec<u8>)> {
        let ip = Ipv4Packet::new_checked(frame).ok()?;
        if ip.next_header() != IpProtocol::Tcp {
            return None;
        }
        let src: IpAddr = ip.src_addr().into();
        let dst: IpAddr = ip.dst_addr().into();
        let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
        if SocketAddr::new(src, tcp.src_port()) != self.peer
            || SocketAddr::new(dst, tcp.dst_port()) != self.local
        {
            return None;
        }
        let flags = TcpFlags {
            syn: tcp.syn(),
            ack: tcp.ack(),
            fin: tcp.fin(),
            psh: tcp.psh(),
        };
        Some((
            tcp.seq_number().0 as u32,
            tcp.ack_number().0 as u32,
            flags,
            tcp.payload().to_vec(),
        ))
    }

    async fn send_ack(&mut self) {
        let frame = tcp_frame_v4(
            self.local,
            self.peer,
            self.snd_nxt,
            self.rcv_nxt,
            TcpFlags {
                ack: true,
                ..TcpFlags::default()
            },
            &[],
            None,
        );
        self.host.inject(&frame[..]).await.unwrap();
    }

    /// Send application data, segmenting as needed.
    pub async fn send(&mut self, data: &[u8]) {
        for chunk in data.chunks(1000) {
            let frame = tcp_frame_v4(
                self.local,
                self.peer,
                self.snd_nxt,
                self.rcv_nxt,
                TcpFlags {
                    ack: true,
                    psh: true,
                    ..TcpFlags::default()
                },
                chunk,
                None,
            );
            self.snd_nxt = self.snd_nxt.wrapping_add(chunk.len() as u32);
            self.host.inject(&frame[..]).await.unwrap();
        }
    }

    /// Half-close: send FIN, keep receiving.
    pub async fn close_write(&mut self) {
        let frame = tcp_frame_v4(
            self.local,
            self.peer,
            self.snd_nxt,
            self.rcv_nxt,
            TcpFlags {
                ack: true,
                fin: true,
                ..TcpFlags::default()
            },
            &[],
            None,
        );
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.host.inject(&frame[..]).await.unwrap();
    }

    async fn pump_one(&mut self) {
        let frame = tokio::time::timeout(FRAME_TIMEOUT, self.host.next_frame())
            .await
            .expect("timed out waiting for tcp segment")
            .expect("device closed");
        let Some((seq, _ack, flags, payload)) = self.parse_segment(&frame) else {
            return;
        };
        let mut advanced = false;
        if !payload.is_empty() {
            if seq == self.rcv_nxt {
                self.received.extend(payload.iter());
                self.rcv_nxt = self.rcv_nxt.wrapping_add(payload.len() as u32);
                advanced = true;
            } else if seq_lt(seq, self.rcv_nxt) {
                // Retransmission of data we already have.
                advanced = true;
            }
        }
        if flags.fin {
            let fin_seq = seq.wrapping_add(payload.len() as u32);
            if fin_seq == self.rcv_nxt {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                self.peer_fin = true;
                advanced = true;
            }
        }
        if advanced {
            self.send_ack().await;
        }
    }

    /// Receive exactly `n` bytes of in-order payload.
    pub async fn recv_exact(&mut self, n: usize) -> Vec<u8> {
        while self.received.len() < n {
            assert!(!self.peer_fin, "peer closed before delivering enough data");
            self.pump_one().await;
        }
        self.received.drain(..n).collect()
    }

    /// Wait for the peer's FIN.
    pub async fn expect_eof(&mut self) {
        while !self.peer_fin {
            self.pump_one().await;
        }
    }

    /// Bytes received so far without waiting.
    pub fn buffered(&self) -> usize {
        self.received.len()
    }
}

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn flags_rst(frame: &[u8]) -> bool {
    let Ok(ip) = Ipv4Packet::new_checked(frame) else {
        return false;
    };
    if ip.next_header() != IpProtocol::Tcp {
        return false;
    }
    TcpPacket::new_checked(ip.payload()).map_or(false, |t| t.rst())
}
