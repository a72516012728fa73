//! Stack configuration
//!
//! Defaults match the wire reality of a TUN-backed gateway: 1500-byte
//! frames, a small per-flow inbound queue (UDP is lossy by contract), and
//! an egress queue deep enough to absorb bursts from the TCP engine
//! without stalling the demux.

use serde::{Deserialize, Serialize};

use crate::device::DEFAULT_MTU;

/// Tunables for [`crate::stack::Stack`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Frame size limit, applied to both directions.
    pub mtu: u16,
    /// Capacity of each accepted packet-conn's inbound queue. Overflow
    /// drops the datagram.
    pub udp_queue_capacity: usize,
    /// Depth of the shared egress queue toward the device.
    pub egress_depth: usize,
    /// Depth of the frame queue toward the TCP engine.
    pub engine_depth: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU as u16,
            udp_queue_capacity: 10,
            egress_depth: 512,
            engine_depth: 512,
        }
    }
}

impl StackConfig {
    #[must_use]
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    #[must_use]
    pub fn with_udp_queue_capacity(mut self, capacity: usize) -> Self {
        self.udp_queue_capacity = capacity;
        self
    }
}
