//! End-to-end UDP plane tests: crafted frames in, crafted frames out.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use smoltcp::wire::{IpAddress, Ipv6Packet, UdpPacket};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tungate::classify::{CidrFilter, ClassifierConfig, FlowClassifier, NoFakeIps, TcpVerdict};
use tungate::device::{ChannelDevice, DeviceHost, DEFAULT_MTU};
use tungate::handler::Handler;
use tungate::stack::{Stack, StackConfig};
use tungate::{TcpFlow, UdpError, UdpFlow};

use common::{next_udp_reply, udp_frame_v4, udp_frame_v6};

fn make_stack(handler: Arc<dyn Handler>) -> (Stack, DeviceHost) {
    let (device, host) = ChannelDevice::new(512, DEFAULT_MTU);
    let classifier = FlowClassifier::new(
        ClassifierConfig::default(),
        Arc::new(CidrFilter::new()),
        Arc::new(NoFakeIps),
    );
    let stack = Stack::new(
        Arc::new(device),
        handler,
        classifier,
        StackConfig::default(),
    );
    (stack, host)
}

/// Echoes every datagram back to where it came from.
struct UdpEcho;

async fn echo_loop(flow: UdpFlow) {
    let mut buf = vec![0u8; 2048];
    loop {
        match flow.recv_from(&mut buf).await {
            Ok((n, addr)) => {
                let _ = flow.send_from(&buf[..n], addr).await;
            }
            Err(_) => break,
        }
    }
}

#[async_trait]
impl Handler for UdpEcho {
    async fn handle_stream(&self, _flow: TcpFlow, _verdict: TcpVerdict) {}
    async fn handle_symmetric(&self, flow: UdpFlow) {
        echo_loop(flow).await;
    }
    async fn handle_fullcone(&self, flow: UdpFlow) {
        echo_loop(flow).await;
    }
    async fn handle_listener(&self, flow: UdpFlow) {
        drop(flow);
    }
}

#[tokio::test]
async fn symmetric_round_trip_with_zero_v4_checksum() {
    common::init_tracing();
    let (mut stack, host) = make_stack(Arc::new(UdpEcho));
    let src: SocketAddr = "10.0.0.2:4000".parse().unwrap();
    // Fake-range destination: classified Symmetric.
    let dst: SocketAddr = "198.18.0.9:443".parse().unwrap();

    let payload: Vec<u8> = (0..1400u32).map(|i| (i % 256) as u8).collect();
    host.inject(&udp_frame_v4(src, dst, &payload)[..])
        .await
        .unwrap();

    let reply = next_udp_reply(&host).await;
    assert_eq!(reply.src, dst, "reply must come from the original target");
    assert_eq!(reply.dst, src);
    assert_eq!(reply.payload, payload);

    // On IPv4 the stack leaves the UDP checksum zero.
    let ip = smoltcp::wire::Ipv4Packet::new_checked(&reply.raw[..]).unwrap();
    let udp = UdpPacket::new_checked(ip.payload()).unwrap();
    assert_eq!(udp.checksum(), 0);

    assert_eq!(stack.stats().udp_flows, 1);
    stack.close().await;
}

#[tokio::test]
async fn fullcone_fan_in_and_fan_out() {
    let (mut stack, host) = make_stack(Arc::new(UdpEcho));
    let src: SocketAddr = "10.0.0.2:4000".parse().unwrap();
    let remotes: Vec<SocketAddr> = vec![
        "198.51.100.1:7777".parse().unwrap(),
        "198.51.100.2:7777".parse().unwrap(),
        "203.0.113.3:9999".parse().unwrap(),
    ];

    for (i, remote) in remotes.iter().enumerate() {
        let payload = format!("probe-{i}");
        host.inject(&udp_frame_v4(src, *remote, payload.as_bytes())[..])
            .await
            .unwrap();
    }

    // Every remote gets back exactly its own payload, from its own address.
    let mut seen = Vec::new();
    for _ in 0..remotes.len() {
        let reply = next_udp_reply(&host).await;
        assert_eq!(reply.dst, src);
        let idx = remotes
            .iter()
            .position(|r| *r == reply.src)
            .expect("reply from unknown remote");
        assert_eq!(reply.payload, format!("probe-{idx}").into_bytes());
        seen.push(idx);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);

    // All three flows shared one packet-conn.
    assert_eq!(stack.stats().udp_flows, 1);
    stack.close().await;
}

/// Holds the queue shut until released, then streams what it reads.
struct Gated {
    gate: Arc<Notify>,
    out: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl Handler for Gated {
    async fn handle_stream(&self, _flow: TcpFlow, _verdict: TcpVerdict) {}
    async fn handle_symmetric(&self, flow: UdpFlow) {
        drop(flow);
    }
    async fn handle_listener(&self, flow: UdpFlow) {
        drop(flow);
    }
    async fn handle_fullcone(&self, flow: UdpFlow) {
        self.gate.notified().await;
        let mut buf = vec![0u8; 2048];
        loop {
            flow.set_read_deadline(Some(Instant::now() + Duration::from_millis(300)));
            match flow.recv_from(&mut buf).await {
                Ok((n, _)) => {
                    let _ = self.out.send(buf[..n].to_vec());
                }
                Err(UdpError::TimedOut) => continue,
                Err(_) => break,
            }
        }
    }
}

#[tokio::test]
async fn queue_overflow_is_lossy_but_live() {
    let gate = Arc::new(Notify::new());
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (mut stack, host) = make_stack(Arc::new(Gated {
        gate: gate.clone(),
        out: out_tx,
    }));

    let src: SocketAddr = "10.0.0.2:4000".parse().unwrap();
    let dst: SocketAddr = "198.51.100.1:7777".parse().unwrap();

    // Eleven datagrams into a capacity-10 queue nobody is draining.
    for i in 0..11u8 {
        host.inject(&udp_frame_v4(src, dst, &[i])[..]).await.unwrap();
    }
    // Let the demux process them all before opening the gate.
    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.notify_one();

    // The first ten arrive in order; the eleventh was dropped.
    for expected in 0..10u8 {
        let got = tokio::time::timeout(Duration::from_secs(5), out_rx.recv())
            .await
            .expect("timed out")
            .expect("handler gone");
        assert_eq!(got, vec![expected]);
    }

    // The queue drained, so a fresh datagram flows through.
    host.inject(&udp_frame_v4(src, dst, b"after")[..])
        .await
        .unwrap();
    let got = tokio::time::timeout(Duration::from_secs(5), out_rx.recv())
        .await
        .expect("timed out")
        .expect("handler gone");
    assert_eq!(got, b"after");

    stack.close().await;
}

#[tokio::test]
async fn ipv6_round_trip_has_valid_checksum() {
    let (mut stack, host) = make_stack(Arc::new(UdpEcho));
    let src: SocketAddr = "[fd00::2]:4000".parse().unwrap();
    let dst: SocketAddr = "[2001:db8::1]:9000".parse().unwrap();

    host.inject(&udp_frame_v6(src, dst, b"sixflow")[..])
        .await
        .unwrap();

    let reply = next_udp_reply(&host).await;
    assert_eq!(reply.src, dst);
    assert_eq!(reply.dst, src);
    assert_eq!(reply.payload, b"sixflow");

    // Mandatory, correct checksum on IPv6.
    let ip = Ipv6Packet::new_checked(&reply.raw[..]).unwrap();
    let udp = UdpPacket::new_checked(ip.payload()).unwrap();
    assert_ne!(udp.checksum(), 0);
    assert!(udp.verify_checksum(
        &IpAddress::Ipv6(ip.src_addr()),
        &IpAddress::Ipv6(ip.dst_addr())
    ));

    stack.close().await;
}

/// Reports what the flow observes when the stack shuts down.
struct CloseProbe {
    events: mpsc::UnboundedSender<&'static str>,
}

#[async_trait]
impl Handler for CloseProbe {
    async fn handle_stream(&self, _flow: TcpFlow, _verdict: TcpVerdict) {}
    async fn handle_symmetric(&self, flow: UdpFlow) {
        drop(flow);
    }
    async fn handle_listener(&self, flow: UdpFlow) {
        drop(flow);
    }
    async fn handle_fullcone(&self, flow: UdpFlow) {
        let mut buf = vec![0u8; 64];
        let _ = flow.recv_from(&mut buf).await;
        let _ = self.events.send("first datagram");
        match flow.recv_from(&mut buf).await {
            Err(UdpError::Closed) => {
                let _ = self.events.send("closed");
            }
            other => panic!("expected Closed, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn stack_close_drains_live_flows() {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (mut stack, host) = make_stack(Arc::new(CloseProbe { events: events_tx }));

    let src: SocketAddr = "10.0.0.2:4000".parse().unwrap();
    let dst: SocketAddr = "198.51.100.1:7777".parse().unwrap();
    host.inject(&udp_frame_v4(src, dst, b"x")[..]).await.unwrap();

    assert_eq!(
        tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap(),
        Some("first datagram")
    );

    stack.close().await;
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap(),
        Some("closed")
    );

    // Idempotent.
    stack.close().await;
}
