//! Flow classification
//!
//! Every newly accepted flow is classified exactly once, before handler
//! dispatch. TCP flows get a routing verdict (direct or proxied, with the
//! original domain recovered when the destination is a fake IP). UDP flows
//! get a packet-conn shape: the fake-IP range maps to a connected peer,
//! un-filtered DNS traffic is hijacked through a listener conn, and
//! everything else is treated as a host behind full-cone NAT.
//!
//! The classifier only reads; the IP filter and the fake-IP reverse map are
//! collaborator traits supplied at construction.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Membership test for "this destination goes through the proxy".
pub trait IpFilter: Send + Sync {
    /// Whether `addr` is covered by the user's proxy filter.
    fn contains(&self, addr: IpAddr) -> bool;
}

/// Result of a fake-IP reverse lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeIpLookup {
    /// The address is a fake IP standing in for this domain.
    Domain(String),
    /// The address is a real one, outside the fake range.
    NotFake,
    /// The address lies in the fake range but no mapping exists (expired
    /// or never allocated).
    NotFound,
}

/// Reverse map from fake IPs to the domains they stand in for.
pub trait FakeIpMap: Send + Sync {
    fn lookup(&self, addr: IpAddr) -> FakeIpLookup;
}

/// Destination handed to the handler for proxied flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// A literal socket address.
    Socket(SocketAddr),
    /// A recovered domain destination.
    Domain(String, u16),
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Socket(addr) => write!(f, "{addr}"),
            Self::Domain(name, port) => write!(f, "{name}:{port}"),
        }
    }
}

/// Routing verdict for an accepted TCP flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpVerdict {
    /// Relay to the destination directly.
    Direct(SocketAddr),
    /// Hand to the proxy upstream, with the recovered target.
    Proxy(TargetAddr),
}

/// Packet-conn shape for an accepted UDP flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UdpShape {
    /// One connected remote peer.
    Symmetric,
    /// Many remotes fanning into one host-facing conn.
    FullCone,
    /// A hijacked local service; host side wildcarded.
    Listener,
}

impl std::fmt::Display for UdpShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Symmetric => write!(f, "symmetric"),
            Self::FullCone => write!(f, "fullcone"),
            Self::Listener => write!(f, "listener"),
        }
    }
}

/// Classifier policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// CIDR of synthetic addresses handed out by DNS interception.
    pub fake_range: Ipv4Net,
    /// Destination port treated as DNS for hijack purposes.
    pub dns_port: u16,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            // The customary benchmarking range reused for fake IPs.
            fake_range: "198.18.0.0/15".parse().expect("valid default cidr"),
            dns_port: 53,
        }
    }
}

/// Decides how each newly observed flow is treated.
pub struct FlowClassifier {
    config: ClassifierConfig,
    filter: Arc<dyn IpFilter>,
    fake_map: Arc<dyn FakeIpMap>,
}

impl FlowClassifier {
    #[must_use]
    pub fn new(
        config: ClassifierConfig,
        filter: Arc<dyn IpFilter>,
        fake_map: Arc<dyn FakeIpMap>,
    ) -> Self {
        Self {
            config,
            filter,
            fake_map,
        }
    }

    /// Verdict for a TCP flow to `dst`.
    ///
    /// Destinations outside the IP filter relay directly. Filtered
    /// destinations go to the proxy; if the address is a fake IP the
    /// original domain is recovered so the proxy sees the real target.
    #[must_use]
    pub fn classify_tcp(&self, dst: SocketAddr) -> TcpVerdict {
        if !self.filter.contains(dst.ip()) {
            return TcpVerdict::Direct(dst);
        }
        match self.fake_map.lookup(dst.ip()) {
            FakeIpLookup::Domain(name) => TcpVerdict::Proxy(TargetAddr::Domain(name, dst.port())),
            FakeIpLookup::NotFake | FakeIpLookup::NotFound => {
                TcpVerdict::Proxy(TargetAddr::Socket(dst))
            }
        }
    }

    /// Shape for a UDP flow to `dst`.
    #[must_use]
    pub fn classify_udp(&self, dst: SocketAddr) -> UdpShape {
        if let IpAddr::V4(v4) = dst.ip() {
            if self.config.fake_range.contains(&v4) {
                return UdpShape::Symmetric;
            }
        }
        if dst.port() == self.config.dns_port && !self.filter.contains(dst.ip()) {
            return UdpShape::Listener;
        }
        UdpShape::FullCone
    }

    /// The configured fake range.
    #[must_use]
    pub fn fake_range(&self) -> Ipv4Net {
        self.config.fake_range
    }
}

/// [`IpFilter`] over a static set of CIDRs.
#[derive(Debug, Default, Clone)]
pub struct CidrFilter {
    v4: Vec<Ipv4Net>,
    v6: Vec<ipnet::Ipv6Net>,
}

impl CidrFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a network to the filter.
    pub fn add(&mut self, net: ipnet::IpNet) {
        match net {
            ipnet::IpNet::V4(n) => self.v4.push(n),
            ipnet::IpNet::V6(n) => self.v6.push(n),
        }
    }

    #[must_use]
    pub fn with(mut self, net: ipnet::IpNet) -> Self {
        self.add(net);
        self
    }
}

impl IpFilter for CidrFilter {
    fn contains(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self.v4.iter().any(|n| n.contains(&v4)),
            IpAddr::V6(v6) => self.v6.iter().any(|n| n.contains(&v6)),
        }
    }
}

/// A map that knows no fake IPs; everything is real.
pub struct NoFakeIps;

impl FakeIpMap for NoFakeIps {
    fn lookup(&self, _addr: IpAddr) -> FakeIpLookup {
        FakeIpLookup::NotFake
    }
}
