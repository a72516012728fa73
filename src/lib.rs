//! tungate: userspace networking plane for a transparent interception gateway
//!
//! This crate terminates the TCP/UDP flows a packet-granular device (TUN
//! interface, diversion driver) intercepts from the host, classifies each
//! flow, and hands fully-formed conversations to an upstream handler for
//! relaying, rewriting or resolution.
//!
//! # Architecture
//!
//! ```text
//! Device (IP frames)
//!     |
//!     v
//! +-------------------------------+
//! |          Stack                |
//! |  inbound pump / demux         |
//! |  - TCP -> embedded engine     |---> TcpFlow  --\
//! |  - UDP -> flow table + shapes |---> UdpFlow  ---+--> Handler
//! |  egress pump                  |                 |
//! +-------------------------------+            relay / dns hijack
//!     |
//!     v
//! Device (IP frames)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tungate::classify::{CidrFilter, ClassifierConfig, FlowClassifier};
//! use tungate::device::{ChannelDevice, DEFAULT_MTU};
//! use tungate::dns::FakeDnsSource;
//! use tungate::handler::DirectHandler;
//! use tungate::stack::{Stack, StackConfig};
//!
//! # struct MyResolver;
//! # #[async_trait::async_trait]
//! # impl tungate::dns::Resolver for MyResolver {
//! #     async fn resolve(&self, _q: &[u8]) -> std::io::Result<Vec<u8>> { Ok(Vec::new()) }
//! # }
//! # async fn example() {
//! let (device, host) = ChannelDevice::new(512, DEFAULT_MTU);
//!
//! let config = ClassifierConfig::default();
//! let fake_dns = Arc::new(FakeDnsSource::new(config.fake_range));
//! let classifier = FlowClassifier::new(
//!     config,
//!     Arc::new(CidrFilter::new()),
//!     fake_dns.clone(),
//! );
//! let handler = Arc::new(DirectHandler::new(fake_dns, Arc::new(MyResolver)));
//!
//! let mut stack = Stack::new(Arc::new(device), handler, classifier, StackConfig::default());
//! // ... feed frames through `host` ...
//! stack.close().await;
//! # }
//! ```
//!
//! # Modules
//!
//! - [`device`]: the abstract IP-frame device and the in-memory channel device
//! - [`stack`]: stack lifecycle, pumps, the TCP plane and accepted streams
//! - [`classify`]: flow classification and its collaborator traits
//! - [`nat`]: UDP flow table and the three packet-conn shapes
//! - [`relay`]: stream and datagram relays with half-close semantics
//! - [`dns`]: DNS hijack loop, fake-IP answer source, pooled buffers
//! - [`handler`]: the upward handler contract and the direct reference handler
//! - [`error`]: the crate error hierarchy

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod classify;
pub mod device;
pub mod dns;
pub mod error;
pub mod handler;
pub mod nat;
pub mod relay;
pub mod stack;

// Re-export the types most embedders touch.
pub use classify::{
    ClassifierConfig, FakeIpLookup, FakeIpMap, FlowClassifier, IpFilter, TargetAddr, TcpVerdict,
    UdpShape,
};
pub use device::{ChannelDevice, Device, DeviceHost};
pub use error::{DeviceError, DnsError, GatewayError, RelayError, StackError, UdpError};
pub use handler::{DirectHandler, Handler};
pub use nat::flow::{UdpFlow, UdpFlowStats};
pub use nat::FlowId;
pub use relay::{relay, relay_datagrams, OutboundDatagram, RelayResult};
pub use stack::tcp::TcpFlow;
pub use stack::{Stack, StackConfig, StackStatsSnapshot};
