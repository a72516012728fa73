//! UDP flow table and demux
//!
//! The UDP plane bypasses the embedded TCP engine entirely: datagrams are
//! demuxed straight off raw frames so that many (local, peer) flows can
//! fan into a single accepted packet-conn, which a per-flow stream API
//! cannot express.
//!
//! All registrations live under one mutex: exact (local, peer)
//! attachments, listener registrations keyed by the hijacked service
//! endpoint, and the full-cone key map keyed by the host endpoint. The
//! whole first-datagram decision (lookup, classify, create, register,
//! deliver) is one critical section, which is what guarantees at most one
//! conn per full-cone key under concurrent first datagrams.
//!
//! Flow removal runs strictly from the conn's close path, through a
//! one-way callback holding a weak table reference (no ownership cycle).

pub mod flow;
pub(crate) mod route;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::classify::{FlowClassifier, UdpShape};

use flow::{FlowShared, UdpFlow};
use route::Route;

/// Identity of one intercepted flow.
///
/// `local` is the host-side source endpoint of the intercepted packet,
/// `peer` the outside destination it was addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId {
    pub local: SocketAddr,
    pub peer: SocketAddr,
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.local, self.peer)
    }
}

/// A freshly created conn that still needs handler dispatch.
pub(crate) struct NewFlow {
    pub flow: UdpFlow,
    pub shape: UdpShape,
}

#[derive(Default)]
struct Table {
    /// Exact (local, peer) pairs: symmetric conns and every flow attached
    /// to a full-cone conn.
    exact: HashMap<FlowId, Arc<FlowShared>>,
    /// Listener conns keyed by the hijacked service endpoint.
    listeners: HashMap<SocketAddr, Arc<FlowShared>>,
    /// Full-cone conns keyed by the host-side endpoint.
    clients: HashMap<SocketAddr, Arc<FlowShared>>,
}

pub(crate) struct PlaneInner {
    table: Mutex<Table>,
    classifier: Arc<FlowClassifier>,
    egress: mpsc::Sender<Bytes>,
    queue_capacity: usize,
}

/// The process-wide UDP demux plane.
pub(crate) struct UdpPlane {
    inner: Arc<PlaneInner>,
}

impl UdpPlane {
    pub(crate) fn new(
        classifier: Arc<FlowClassifier>,
        egress: mpsc::Sender<Bytes>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PlaneInner {
                table: Mutex::new(Table::default()),
                classifier,
                egress,
                queue_capacity,
            }),
        }
    }

    /// Route one inbound datagram.
    ///
    /// Existing attachments get the datagram delivered; the first datagram
    /// of an unknown flow classifies it and may create a conn, which the
    /// caller must dispatch to the handler.
    pub(crate) fn handle_datagram(&self, id: FlowId, payload: Bytes) -> Option<NewFlow> {
        let mut table = self.inner.table.lock();

        if let Some(conn) = table.exact.get(&id).cloned() {
            if conn.is_closed() {
                table.exact.remove(&id);
            } else {
                conn.deliver(tag_for(conn.shape(), id), payload);
                return None;
            }
        }

        if let Some(conn) = table.listeners.get(&id.peer).cloned() {
            if conn.is_closed() {
                table.listeners.remove(&id.peer);
            } else {
                conn.deliver(id.local, payload);
                return None;
            }
        }

        match self.inner.classifier.classify_udp(id.peer) {
            UdpShape::FullCone => {
                if let Some(conn) = table.clients.get(&id.local).cloned() {
                    if conn.is_closed() {
                        table.clients.remove(&id.local);
                    } else {
                        // A new (local, peer) pair landing on a live conn:
                        // register it, remember its route, deliver.
                        conn.attach(id, Route::new(id, self.inner.egress.clone()));
                        table.exact.insert(id, conn.clone());
                        conn.deliver(id.peer, payload);
                        return None;
                    }
                }
                Some(self.create(&mut table, UdpShape::FullCone, id, payload))
            }
            shape => Some(self.create(&mut table, shape, id, payload)),
        }
    }

    fn create(&self, table: &mut Table, shape: UdpShape, id: FlowId, payload: Bytes) -> NewFlow {
        debug!(%id, %shape, "new udp flow");
        let route = Route::new(id, self.inner.egress.clone());
        let (shared, rx) = FlowShared::new(shape, id, route, self.inner.queue_capacity);

        match shape {
            UdpShape::Symmetric => {
                table.exact.insert(id, shared.clone());
            }
            UdpShape::FullCone => {
                table.exact.insert(id, shared.clone());
                table.clients.insert(id.local, shared.clone());
            }
            UdpShape::Listener => {
                table.listeners.insert(id.peer, shared.clone());
            }
        }

        let weak = Arc::downgrade(&self.inner);
        shared.set_unregister(Box::new(move |ids| {
            let Some(inner) = weak.upgrade() else { return };
            let mut table = inner.table.lock();
            for flow_id in ids {
                table.exact.remove(&flow_id);
            }
            match shape {
                UdpShape::FullCone => {
                    table.clients.remove(&id.local);
                }
                UdpShape::Listener => {
                    table.listeners.remove(&id.peer);
                }
                UdpShape::Symmetric => {}
            }
        }));

        shared.deliver(tag_for(shape, id), payload);
        NewFlow {
            flow: UdpFlow::new(shared, rx),
            shape,
        }
    }

    /// Close every live conn. Called from stack shutdown.
    pub(crate) fn close_all(&self) {
        let conns: Vec<Arc<FlowShared>> = {
            let table = self.inner.table.lock();
            table
                .exact
                .values()
                .chain(table.listeners.values())
                .chain(table.clients.values())
                .cloned()
                .collect()
        };
        // Close outside the table lock: close re-enters it via the
        // unregister callback.
        for conn in conns {
            conn.close();
        }
    }

    /// Number of live registrations, for stats and tests.
    pub(crate) fn table_size(&self) -> (usize, usize, usize) {
        let table = self.inner.table.lock();
        (
            table.exact.len(),
            table.listeners.len(),
            table.clients.len(),
        )
    }
}

/// What a delivered datagram is tagged with, per shape.
fn tag_for(shape: UdpShape, id: FlowId) -> SocketAddr {
    match shape {
        // Connected shapes surface the outside destination.
        UdpShape::Symmetric | UdpShape::FullCone => id.peer,
        // Listener conns surface the host endpoint to reply to.
        UdpShape::Listener => id.local,
    }
}
