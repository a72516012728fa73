//! Stack lifecycle and pumps
//!
//! The [`Stack`] owns the whole userspace networking plane:
//!
//! ```text
//! Device ──rx──> inbound pump ──┬── TCP frames ──> embedded engine ──> accept loop ──> Handler
//!                               └── UDP frames ──> demux plane ─────────────────────> Handler
//! Device <──tx── egress pump <──── engine output + packet-conn routes
//! ```
//!
//! TCP termination is delegated to the `ipstack` engine, fed through
//! [`frame_pipe::FramePipe`]; the engine sees a NIC that owns the entire
//! address space, so every injected packet is delivered locally. UDP never
//! enters the engine: the demux plane in [`crate::nat`] materializes the
//! packet-conn shapes directly from raw frames.
//!
//! Per-flow errors never take the stack down. Malformed frames are counted
//! and dropped; a failed accept is the peer's problem; only device death
//! stops the pumps.

pub mod config;
mod frame_pipe;
pub mod tcp;

pub use config::StackConfig;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use ipstack::stream::IpStackStream;
use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet, UdpPacket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::classify::{FlowClassifier, UdpShape};
use crate::device::Device;
use crate::error::DeviceError;
use crate::handler::Handler;
use crate::nat::{FlowId, NewFlow, UdpPlane};

use frame_pipe::FramePipe;
use tcp::TcpFlow;

/// Stack-wide counters.
///
/// Relaxed ordering throughout; the counters inform, they do not
/// synchronize.
#[derive(Debug, Default)]
pub struct StackStats {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    malformed: AtomicU64,
    other_proto: AtomicU64,
    tcp_accepted: AtomicU64,
    udp_flows: AtomicU64,
    write_errors: AtomicU64,
}

/// Point-in-time copy of [`StackStats`].
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StackStatsSnapshot {
    /// Frames read from the device
    pub frames_in: u64,
    /// Frames written to the device
    pub frames_out: u64,
    /// Frames dropped as unparseable or unroutable
    pub malformed: u64,
    /// Frames dropped for carrying a protocol the stack does not terminate
    pub other_proto: u64,
    /// TCP flows accepted and dispatched
    pub tcp_accepted: u64,
    /// UDP packet-conns created and dispatched
    pub udp_flows: u64,
    /// Device write failures (excluding shutdown)
    pub write_errors: u64,
}

impl StackStats {
    fn snapshot(&self) -> StackStatsSnapshot {
        StackStatsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            other_proto: self.other_proto.load(Ordering::Relaxed),
            tcp_accepted: self.tcp_accepted.load(Ordering::Relaxed),
            udp_flows: self.udp_flows.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

struct StackInner {
    device: Arc<dyn Device>,
    handler: Arc<dyn Handler>,
    classifier: Arc<FlowClassifier>,
    udp: UdpPlane,
    engine_tx: mpsc::Sender<BytesMut>,
    stats: StackStats,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

/// The userspace networking plane. Construct once with [`Stack::new`];
/// close once with [`Stack::close`]. Closing drains every accepted flow.
pub struct Stack {
    inner: Arc<StackInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl Stack {
    /// Build the plane and start its pumps.
    #[must_use]
    pub fn new(
        device: Arc<dyn Device>,
        handler: Arc<dyn Handler>,
        classifier: FlowClassifier,
        config: StackConfig,
    ) -> Self {
        let classifier = Arc::new(classifier);
        let (engine_tx, engine_rx) = mpsc::channel(config.engine_depth);
        let (egress_tx, egress_rx) = mpsc::channel(config.egress_depth);

        let pipe = FramePipe::new(engine_rx, egress_tx.clone());
        let mut engine_config = ipstack::IpStackConfig::default();
        engine_config.mtu(config.mtu);
        let engine = ipstack::IpStack::new(engine_config, pipe);

        let inner = Arc::new(StackInner {
            device,
            handler,
            classifier: classifier.clone(),
            udp: UdpPlane::new(classifier, egress_tx, config.udp_queue_capacity),
            engine_tx,
            stats: StackStats::default(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        let tasks = vec![
            tokio::spawn(inbound_pump(inner.clone())),
            tokio::spawn(egress_pump(inner.clone(), egress_rx)),
            tokio::spawn(accept_loop(inner.clone(), engine)),
        ];

        info!(mtu = config.mtu, "stack started");
        Self { inner, tasks }
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> StackStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Tear the stack down: stop the pumps, close every live packet-conn,
    /// drop the TCP engine (closing its streams) and close the device.
    /// Idempotent.
    pub async fn close(&mut self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(stats = ?self.inner.stats.snapshot(), "stack closing");
        self.inner.shutdown.cancel();
        self.inner.udp.close_all();
        // Unblock any pump stuck in a device call before joining them.
        self.inner.device.close();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        self.inner.udp.close_all();
        for task in &self.tasks {
            task.abort();
        }
        self.inner.device.close();
    }
}

/// What the inbound demux decided about one frame.
enum FrameKind {
    Tcp,
    Udp { id: FlowId, payload: Bytes },
    Other(u8),
    Malformed,
}

fn classify_frame(frame: &[u8]) -> FrameKind {
    match frame.first().map(|b| b >> 4) {
        Some(4) => {
            let Ok(ip) = Ipv4Packet::new_checked(frame) else {
                return FrameKind::Malformed;
            };
            match ip.next_header() {
                IpProtocol::Tcp => FrameKind::Tcp,
                IpProtocol::Udp => {
                    if ip.more_frags() || ip.frag_offset() != 0 {
                        // Fragmented UDP cannot be demuxed per-flow.
                        return FrameKind::Malformed;
                    }
                    parse_udp(ip.src_addr().into(), ip.dst_addr().into(), ip.payload())
                }
                proto => FrameKind::Other(proto.into()),
            }
        }
        Some(6) => {
            let Ok(ip) = Ipv6Packet::new_checked(frame) else {
                return FrameKind::Malformed;
            };
            match ip.next_header() {
                IpProtocol::Tcp => FrameKind::Tcp,
                IpProtocol::Udp => {
                    parse_udp(ip.src_addr().into(), ip.dst_addr().into(), ip.payload())
                }
                proto => FrameKind::Other(proto.into()),
            }
        }
        _ => FrameKind::Malformed,
    }
}

fn parse_udp(src: std::net::IpAddr, dst: std::net::IpAddr, payload: &[u8]) -> FrameKind {
    let Ok(udp) = UdpPacket::new_checked(payload) else {
        return FrameKind::Malformed;
    };
    let id = FlowId {
        local: std::net::SocketAddr::new(src, udp.src_port()),
        peer: std::net::SocketAddr::new(dst, udp.dst_port()),
    };
    FrameKind::Udp {
        id,
        payload: Bytes::copy_from_slice(udp.payload()),
    }
}

async fn inbound_pump(inner: Arc<StackInner>) {
    debug!("inbound pump started");
    loop {
        let frame = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            frame = inner.device.recv_frame() => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(DeviceError::Closed) => {
                debug!("device closed, inbound pump stopping");
                break;
            }
            Err(e) => {
                warn!(error = %e, "device read failed, inbound pump stopping");
                break;
            }
        };

        inner.stats.frames_in.fetch_add(1, Ordering::Relaxed);
        match classify_frame(&frame) {
            FrameKind::Tcp => {
                if inner.engine_tx.send(frame).await.is_err() {
                    debug!("tcp engine gone, inbound pump stopping");
                    break;
                }
            }
            FrameKind::Udp { id, payload } => {
                if let Some(new_flow) = inner.udp.handle_datagram(id, payload) {
                    inner.stats.udp_flows.fetch_add(1, Ordering::Relaxed);
                    dispatch_udp(&inner, new_flow);
                }
            }
            FrameKind::Other(proto) => {
                inner.stats.other_proto.fetch_add(1, Ordering::Relaxed);
                trace!(proto, "dropping frame for unhandled protocol");
            }
            FrameKind::Malformed => {
                inner.stats.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(len = frame.len(), "dropping malformed frame");
            }
        }
    }
    debug!("inbound pump stopped");
}

fn dispatch_udp(inner: &Arc<StackInner>, new_flow: NewFlow) {
    let handler = inner.handler.clone();
    let NewFlow { flow, shape } = new_flow;
    debug!(local = %flow.local_addr(), peer = %flow.peer_addr(), %shape, "udp flow dispatched");
    tokio::spawn(async move {
        match shape {
            UdpShape::Symmetric => handler.handle_symmetric(flow).await,
            UdpShape::FullCone => handler.handle_fullcone(flow).await,
            UdpShape::Listener => handler.handle_listener(flow).await,
        }
    });
}

async fn egress_pump(inner: Arc<StackInner>, mut egress_rx: mpsc::Receiver<Bytes>) {
    debug!("egress pump started");
    loop {
        let frame = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            frame = egress_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        write_frame(&inner, frame).await;
    }
    // Best-effort drain of what was queued before shutdown.
    while let Ok(frame) = egress_rx.try_recv() {
        write_frame(&inner, frame).await;
    }
    debug!("egress pump stopped");
}

async fn write_frame(inner: &Arc<StackInner>, frame: Bytes) {
    match inner.device.send_frame(frame).await {
        Ok(()) => {
            inner.stats.frames_out.fetch_add(1, Ordering::Relaxed);
        }
        // Shutdown in progress: swallow, the pump will stop shortly.
        Err(DeviceError::Closed) => {}
        Err(e) => {
            inner.stats.write_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "write to device failed");
        }
    }
}

async fn accept_loop(inner: Arc<StackInner>, mut engine: ipstack::IpStack) {
    debug!("accept loop started");
    loop {
        let accepted = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            accepted = engine.accept() => accepted,
        };
        match accepted {
            Ok(IpStackStream::Tcp(stream)) => {
                inner.stats.tcp_accepted.fetch_add(1, Ordering::Relaxed);
                let flow = TcpFlow::new(stream);
                let verdict = inner.classifier.classify_tcp(flow.peer_addr());
                debug!(
                    local = %flow.local_addr(),
                    peer = %flow.peer_addr(),
                    ?verdict,
                    "tcp flow accepted"
                );
                let handler = inner.handler.clone();
                tokio::spawn(async move {
                    handler.handle_stream(flow, verdict).await;
                });
            }
            Ok(IpStackStream::Udp(stream)) => {
                // UDP never enters the engine; anything surfacing here is
                // a stray and gets dropped with its conn.
                trace!(peer = %stream.peer_addr(), "ignoring udp stream from engine");
            }
            Ok(IpStackStream::UnknownTransport(pkt)) => {
                inner.stats.other_proto.fetch_add(1, Ordering::Relaxed);
                trace!(src = %pkt.src_addr(), dst = %pkt.dst_addr(), "unknown transport");
            }
            Ok(IpStackStream::UnknownNetwork(pkt)) => {
                inner.stats.malformed.fetch_add(1, Ordering::Relaxed);
                trace!(len = pkt.len(), "unknown network packet");
            }
            Err(e) => {
                if inner.shutdown.is_cancelled() {
                    break;
                }
                warn!(error = ?e, "engine accept failed");
                // Do not spin on persistent engine errors.
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    debug!("accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::route::build_udp_frame;

    #[test]
    fn classifies_udp_frames() {
        let frame = build_udp_frame(
            "10.0.0.2:4000".parse().unwrap(),
            "198.51.100.1:7777".parse().unwrap(),
            b"payload",
        )
        .unwrap();
        match classify_frame(&frame) {
            FrameKind::Udp { id, payload } => {
                assert_eq!(id.local, "10.0.0.2:4000".parse().unwrap());
                assert_eq!(id.peer, "198.51.100.1:7777".parse().unwrap());
                assert_eq!(&payload[..], b"payload");
            }
            _ => panic!("expected udp frame"),
        }
    }

    #[test]
    fn classifies_v6_udp_frames() {
        let frame = build_udp_frame(
            "[fd00::2]:4000".parse().unwrap(),
            "[2001:db8::1]:9000".parse().unwrap(),
            b"six",
        )
        .unwrap();
        assert!(matches!(classify_frame(&frame), FrameKind::Udp { .. }));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(classify_frame(&[]), FrameKind::Malformed));
        assert!(matches!(classify_frame(&[0x00; 40]), FrameKind::Malformed));
        // Truncated IPv4 header.
        assert!(matches!(
            classify_frame(&[0x45, 0x00, 0x00]),
            FrameKind::Malformed
        ));
    }

    #[test]
    fn non_transport_protocols_are_other() {
        // Minimal ICMP frame: valid IPv4 header, protocol 1.
        let mut frame = vec![0u8; 28];
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut frame[..]);
            ip.set_version(4);
            ip.set_header_len(20);
            ip.set_total_len(28);
            ip.set_hop_limit(64);
            ip.set_next_header(IpProtocol::Icmp);
            ip.set_src_addr("10.0.0.2".parse().unwrap());
            ip.set_dst_addr("10.0.0.3".parse().unwrap());
            ip.fill_checksum();
        }
        assert!(matches!(classify_frame(&frame), FrameKind::Other(1)));
    }
}
