//! The upward handler contract
//!
//! The stack calls into a [`Handler`] exactly once per accepted flow,
//! after classification. The handler owns the flow from then on and must
//! close it (dropping it does). Handler errors never reach the stack:
//! implementations log and close.

mod direct;

pub use direct::DirectHandler;

use async_trait::async_trait;

use crate::classify::TcpVerdict;
use crate::nat::flow::UdpFlow;
use crate::stack::tcp::TcpFlow;

/// Upstream logic the stack dispatches accepted flows to.
#[async_trait]
pub trait Handler: Send + Sync {
    /// One accepted TCP flow, with its routing verdict.
    async fn handle_stream(&self, flow: TcpFlow, verdict: TcpVerdict);

    /// One accepted UDP flow with a single connected peer.
    async fn handle_symmetric(&self, flow: UdpFlow);

    /// One accepted full-cone UDP flow; datagrams are tagged with the
    /// outside peer they were addressed to.
    async fn handle_fullcone(&self, flow: UdpFlow);

    /// One hijacked listener flow; datagrams are tagged with the host
    /// endpoint they came from.
    async fn handle_listener(&self, flow: UdpFlow);
}
