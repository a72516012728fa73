//! Direct reference handler
//!
//! Relays every accepted flow straight to its real destination: TCP flows
//! get a dialed connection and the stream relay, UDP flows get an
//! unconnected socket and the datagram relay, and hijacked listener conns
//! run the DNS loop. Useful on its own for a pure transparent gateway and
//! as the template for proxy handlers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use crate::classify::{TargetAddr, TcpVerdict};
use crate::dns::{self, DnsAnswerSource, MessagePool, Resolver, DNS_IDLE_TIMEOUT};
use crate::nat::flow::UdpFlow;
use crate::relay::{relay, relay_datagrams, UDP_RELAY_IDLE};
use crate::stack::tcp::TcpFlow;

use super::Handler;

/// Handler that dials destinations directly.
pub struct DirectHandler {
    answers: Arc<dyn DnsAnswerSource>,
    resolver: Arc<dyn Resolver>,
    pool: Arc<MessagePool>,
    udp_idle: Duration,
    dns_idle: Duration,
}

impl DirectHandler {
    #[must_use]
    pub fn new(answers: Arc<dyn DnsAnswerSource>, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            answers,
            resolver,
            pool: MessagePool::new(64),
            udp_idle: UDP_RELAY_IDLE,
            dns_idle: DNS_IDLE_TIMEOUT,
        }
    }

    /// Override the datagram relay idle window.
    #[must_use]
    pub fn with_udp_idle(mut self, idle: Duration) -> Self {
        self.udp_idle = idle;
        self
    }

    async fn connect(verdict: &TcpVerdict) -> std::io::Result<TcpStream> {
        match verdict {
            TcpVerdict::Direct(addr) | TcpVerdict::Proxy(TargetAddr::Socket(addr)) => {
                TcpStream::connect(addr).await
            }
            TcpVerdict::Proxy(TargetAddr::Domain(name, port)) => {
                TcpStream::connect((name.as_str(), *port)).await
            }
        }
    }

    async fn run_udp(&self, flow: UdpFlow) {
        let bind_addr = if flow.peer_addr().is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let outbound = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, "udp outbound bind failed");
                flow.close();
                return;
            }
        };
        info!(local = %flow.local_addr(), shape = %flow.shape(), "direct udp relay");
        if let Err(e) = relay_datagrams(&flow, &outbound, self.udp_idle).await {
            debug!(error = %e, "udp relay ended with error");
        }
    }
}

#[async_trait]
impl Handler for DirectHandler {
    async fn handle_stream(&self, mut flow: TcpFlow, verdict: TcpVerdict) {
        let target = match &verdict {
            TcpVerdict::Direct(addr) => addr.to_string(),
            TcpVerdict::Proxy(target) => target.to_string(),
        };
        let mut remote = match Self::connect(&verdict).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%target, error = %e, "dial failed");
                flow.close().await;
                return;
            }
        };
        // Delayed ACKs interact badly with the engine's pacing.
        if let Err(e) = remote.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        info!(local = %flow.local_addr(), %target, "direct tcp relay");
        match relay(&mut flow, &mut remote).await {
            Ok(result) => {
                debug!(%target, up = result.to_remote, down = result.to_local, "tcp relay done");
            }
            Err(e) => debug!(%target, error = %e, "tcp relay ended with error"),
        }
        flow.close().await;
    }

    async fn handle_symmetric(&self, flow: UdpFlow) {
        self.run_udp(flow).await;
    }

    async fn handle_fullcone(&self, flow: UdpFlow) {
        self.run_udp(flow).await;
    }

    async fn handle_listener(&self, flow: UdpFlow) {
        info!(service = %flow.peer_addr(), "dns hijack");
        if let Err(e) = dns::serve(
            &flow,
            self.answers.as_ref(),
            self.resolver.as_ref(),
            &self.pool,
            self.dns_idle,
        )
        .await
        {
            debug!(error = %e, "dns hijack ended with error");
        }
    }
}
