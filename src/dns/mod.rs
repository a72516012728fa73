//! DNS hijack
//!
//! Listener packet-conns carry intercepted DNS traffic. [`serve`] runs the
//! per-datagram loop on one of them: decode the query, let the in-process
//! answer source rewrite it (fake A answers for configured domains), and
//! fall back to the external resolver for everything else. Replies go back
//! on the same conn, addressed to the host endpoint the query came from.
//!
//! Parse and resolver failures drop the datagram and keep the loop alive;
//! three seconds of inactivity close the conn.

mod fake;
mod pool;

pub use fake::{FakeDnsSource, FAKE_TTL};
pub use pool::{MessagePool, PoolStats, QueryBuffer, QUERY_PAYLOAD_SIZE, QUERY_PREFIX};

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DnsError, UdpError};
use crate::nat::flow::UdpFlow;

/// Inactivity window after which a hijacked conn is forced closed.
pub const DNS_IDLE_TIMEOUT: Duration = Duration::from_secs(3);

/// External resolver the hijack loop falls back to.
///
/// Takes and returns raw DNS wire bytes. Timeout behavior is the
/// resolver's own; the loop absorbs its failures.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, query: &[u8]) -> io::Result<Vec<u8>>;
}

/// In-process answer source consulted before the resolver.
///
/// May rewrite the query into a response in place; the loop checks the
/// message type afterwards to see whether it did.
pub trait DnsAnswerSource: Send + Sync {
    fn apply(&self, msg: &mut Message);
}

/// Run the hijack loop on a listener conn until it goes idle or closes.
///
/// The conn is closed on return.
pub async fn serve(
    flow: &UdpFlow,
    answers: &dyn DnsAnswerSource,
    resolver: &dyn Resolver,
    pool: &Arc<MessagePool>,
    idle: Duration,
) -> Result<(), DnsError> {
    let result = serve_inner(flow, answers, resolver, pool, idle).await;
    flow.close();
    result
}

async fn serve_inner(
    flow: &UdpFlow,
    answers: &dyn DnsAnswerSource,
    resolver: &dyn Resolver,
    pool: &Arc<MessagePool>,
    idle: Duration,
) -> Result<(), DnsError> {
    loop {
        let mut buf = pool.acquire();
        flow.set_read_deadline(Some(Instant::now() + idle));
        let (len, raddr) = match flow.recv_from(&mut buf).await {
            Ok(ok) => ok,
            Err(UdpError::TimedOut) => {
                debug!(conn = %flow.peer_addr(), "dns conn idle, closing");
                return Ok(());
            }
            Err(UdpError::Closed) => return Ok(()),
            Err(UdpError::Truncated { copied, from }) => {
                debug!(copied, %from, "dns query larger than buffer, dropped");
                continue;
            }
            Err(e) => return Err(DnsError::Conn(e)),
        };

        let mut msg = match Message::from_vec(&buf[..len]) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, %raddr, "dns parse failed, dropping");
                continue;
            }
        };

        if let Some(query) = msg.queries().first() {
            info!(host = %raddr, name = %query.name(), qtype = ?query.query_type(), "dns query");
        }

        answers.apply(&mut msg);

        let wire = if msg.message_type() == MessageType::Response {
            match msg.to_vec() {
                Ok(wire) => wire,
                Err(e) => {
                    warn!(error = %e, "dns encode failed, dropping");
                    continue;
                }
            }
        } else {
            match resolver.resolve(&buf[..len]).await {
                Ok(wire) => wire,
                Err(e) => {
                    debug!(error = %e, "resolver failed, dropping");
                    continue;
                }
            }
        };

        if let Err(e) = flow.send_to(&wire, raddr).await {
            if e.is_clean() {
                return Ok(());
            }
            warn!(error = %e, %raddr, "dns reply write failed");
        }
    }
}
