//! Accepted packet-conns
//!
//! [`UdpFlow`] is the object handed to the handler for every accepted UDP
//! flow. One concrete type covers the three shapes; behavior differences
//! (what reads are tagged with, which send verb applies) hang off the
//! [`UdpShape`] tag rather than a type hierarchy.
//!
//! Internally a flow is a bounded inbound queue fed by the demux, an
//! append-only route list, a one-shot close signal, and a deadline pair.
//! The queue capacity is small and overflow drops the datagram: the
//! protocol is lossy by contract and retransmission is the peer's problem.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::classify::UdpShape;
use crate::error::UdpError;

use super::route::Route;
use super::FlowId;

/// Datagrams delivered through the inbound queue.
#[derive(Debug, Clone)]
pub(crate) struct Datagram {
    pub addr: SocketAddr,
    pub payload: Bytes,
}

/// One-way cleanup hook into the flow table.
///
/// The flow holds only this opaque callback and its registered flow ids,
/// never the table itself, so table -> flow stays the only strong edge.
pub(crate) type Unregister = Box<dyn FnOnce(Vec<FlowId>) + Send>;

#[derive(Debug, Default)]
struct FlowCounters {
    received: AtomicU64,
    dropped: AtomicU64,
    sent: AtomicU64,
    send_errors: AtomicU64,
}

/// Counter snapshot for one accepted packet-conn.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct UdpFlowStats {
    /// Datagrams delivered into the inbound queue
    pub received: u64,
    /// Datagrams dropped because the queue was full
    pub dropped: u64,
    /// Datagrams successfully submitted for egress
    pub sent: u64,
    /// Egress submissions that failed
    pub send_errors: u64,
}

/// State shared between the demux (producer side) and the handler's
/// [`UdpFlow`] (consumer side).
pub(crate) struct FlowShared {
    shape: UdpShape,
    local: SocketAddr,
    peer: SocketAddr,
    tx: mpsc::Sender<Datagram>,
    routes: Mutex<Vec<Route>>,
    flow_ids: Mutex<Vec<FlowId>>,
    closed: CancellationToken,
    close_once: AtomicBool,
    read_deadline: watch::Sender<Option<Instant>>,
    write_deadline: watch::Sender<Option<Instant>>,
    unregister: Mutex<Option<Unregister>>,
    counters: FlowCounters,
}

impl FlowShared {
    pub(crate) fn new(
        shape: UdpShape,
        id: FlowId,
        route: Route,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Datagram>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let (read_deadline, _) = watch::channel(None);
        let (write_deadline, _) = watch::channel(None);
        // Listener conns register once with the host side wildcarded, so
        // they have no exact flow ids to unregister.
        let flow_ids = match shape {
            UdpShape::Listener => Vec::new(),
            UdpShape::Symmetric | UdpShape::FullCone => vec![id],
        };
        let shared = Arc::new(Self {
            shape,
            local: id.local,
            peer: id.peer,
            tx,
            routes: Mutex::new(vec![route]),
            flow_ids: Mutex::new(flow_ids),
            closed: CancellationToken::new(),
            close_once: AtomicBool::new(false),
            read_deadline,
            write_deadline,
            unregister: Mutex::new(None),
            counters: FlowCounters::default(),
        });
        (shared, rx)
    }

    pub(crate) fn shape(&self) -> UdpShape {
        self.shape
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.close_once.load(Ordering::SeqCst)
    }

    pub(crate) fn set_unregister(&self, callback: Unregister) {
        *self.unregister.lock() = Some(callback);
    }

    /// Register an additional (local, peer) pair on this conn.
    ///
    /// Only the demux calls this, before delivering the triggering
    /// datagram; close is the only reader of the accumulated lists.
    pub(crate) fn attach(&self, id: FlowId, route: Route) {
        self.routes.lock().push(route);
        self.flow_ids.lock().push(id);
    }

    /// Push one datagram into the inbound queue, dropping on overflow.
    pub(crate) fn deliver(&self, addr: SocketAddr, payload: Bytes) {
        if self.is_closed() {
            return;
        }
        match self.tx.try_send(Datagram { addr, payload }) {
            Ok(()) => {
                self.counters.received.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(flow = %self.local, %addr, "inbound queue full, datagram dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// One-shot close: cancel readers, release routes, unregister.
    pub(crate) fn close(&self) {
        if self.close_once.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();
        self.routes.lock().clear();
        let ids: Vec<FlowId> = std::mem::take(&mut *self.flow_ids.lock());
        let callback = self.unregister.lock().take();
        if let Some(callback) = callback {
            callback(ids);
        }
    }

    fn check_writable(&self) -> Result<(), UdpError> {
        if self.is_closed() {
            return Err(UdpError::Closed);
        }
        if let Some(at) = *self.write_deadline.borrow() {
            if at <= Instant::now() {
                return Err(UdpError::TimedOut);
            }
        }
        Ok(())
    }

    async fn send_via(&self, route: Route, payload: &[u8]) -> Result<usize, UdpError> {
        match route.send(payload).await {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                Ok(payload.len())
            }
            Err(err) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for FlowShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowShared")
            .field("shape", &self.shape)
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// An accepted UDP packet-conn.
///
/// Reads yield `(len, addr)` where the meaning of `addr` depends on the
/// shape: the outside peer a datagram was sent to (Symmetric, FullCone) or
/// the host endpoint it came from (Listener). Writes mirror that:
/// [`UdpFlow::send_from`] picks the outside source for Symmetric/FullCone
/// conns, [`UdpFlow::send_to`] picks the host destination for Listener
/// conns.
///
/// Dropping the flow closes it.
#[derive(Debug)]
pub struct UdpFlow {
    shared: Arc<FlowShared>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Datagram>>,
}

impl UdpFlow {
    pub(crate) fn new(shared: Arc<FlowShared>, rx: mpsc::Receiver<Datagram>) -> Self {
        Self {
            shared,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// The shape this conn was classified into.
    #[must_use]
    pub fn shape(&self) -> UdpShape {
        self.shared.shape
    }

    /// Host-side endpoint of the first observed flow.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local
    }

    /// Outside endpoint of the first observed flow. For Listener conns this
    /// is the hijacked service endpoint the conn is keyed by.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Arm or clear the read deadline. `None` cancels it. A deadline in the
    /// past makes every read return [`UdpError::TimedOut`] until advanced.
    pub fn set_read_deadline(&self, at: Option<Instant>) {
        self.shared.read_deadline.send_replace(at);
    }

    /// Arm or clear the write deadline.
    pub fn set_write_deadline(&self, at: Option<Instant>) {
        self.shared.write_deadline.send_replace(at);
    }

    /// Receive one datagram into `buf`.
    ///
    /// Blocks until a datagram arrives, the conn is closed
    /// ([`UdpError::Closed`], the end-of-stream signal) or the read
    /// deadline expires ([`UdpError::TimedOut`]). A buffer smaller than
    /// the datagram yields [`UdpError::Truncated`] carrying the copied
    /// length and the address.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), UdpError> {
        let mut rx = self.rx.lock().await;
        let mut deadline = self.shared.read_deadline.subscribe();
        loop {
            let at = *deadline.borrow_and_update();
            tokio::select! {
                biased;
                () = self.shared.closed.cancelled() => return Err(UdpError::Closed),
                () = deadline_wait(at) => return Err(UdpError::TimedOut),
                datagram = rx.recv() => {
                    let Some(datagram) = datagram else {
                        return Err(UdpError::Closed);
                    };
                    let n = datagram.payload.len().min(buf.len());
                    buf[..n].copy_from_slice(&datagram.payload[..n]);
                    if n < datagram.payload.len() {
                        return Err(UdpError::Truncated {
                            copied: n,
                            from: datagram.addr,
                        });
                    }
                    return Ok((n, datagram.addr));
                }
                _ = deadline.changed() => {}
            }
        }
    }

    /// Send `buf` toward the host with `from` as the outside source.
    ///
    /// Symmetric and FullCone conns only. Picks the route registered for
    /// `from`; if none matches, the first route is cloned with its outside
    /// address rewritten.
    pub async fn send_from(&self, buf: &[u8], from: SocketAddr) -> Result<usize, UdpError> {
        if self.shared.shape == UdpShape::Listener {
            return Err(UdpError::InvalidOperation(
                "listener conns reply with send_to",
            ));
        }
        self.shared.check_writable()?;
        let route = {
            let routes = self.shared.routes.lock();
            let Some(first) = routes.first() else {
                return Err(UdpError::Closed);
            };
            routes
                .iter()
                .find(|r| r.peer == from)
                .cloned()
                .unwrap_or_else(|| first.rewrite_peer(from))
        };
        self.shared.send_via(route, buf).await
    }

    /// Send `buf` from the hijacked service endpoint to the host endpoint
    /// `to`. Listener conns only.
    pub async fn send_to(&self, buf: &[u8], to: SocketAddr) -> Result<usize, UdpError> {
        if self.shared.shape != UdpShape::Listener {
            return Err(UdpError::InvalidOperation(
                "connected conns reply with send_from",
            ));
        }
        self.shared.check_writable()?;
        let route = {
            let routes = self.shared.routes.lock();
            let Some(first) = routes.first() else {
                return Err(UdpError::Closed);
            };
            first.rewrite_local(to)
        };
        self.shared.send_via(route, buf).await
    }

    /// Close the conn. Idempotent; pending reads return
    /// [`UdpError::Closed`] and the flow table entry is removed exactly
    /// once.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Resolves once the conn has been closed from either side.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    /// Whether the conn has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> UdpFlowStats {
        let c = &self.shared.counters;
        UdpFlowStats {
            received: c.received.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            sent: c.sent.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for UdpFlow {
    fn drop(&mut self) {
        self.shared.close();
    }
}

async fn deadline_wait(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
