//! In-memory fake-IP answer source
//!
//! Maps configured domains to synthetic IPv4 addresses from a reserved
//! range and answers intercepted A queries with them. The same table
//! serves as the classifier's reverse map: traffic to a fake IP can be
//! traced back to the domain it stands in for.
//!
//! AAAA queries for known domains get an empty answer, steering dual-stack
//! hosts onto the fake IPv4 path. Everything else is left untouched so the
//! hijack loop falls through to the real resolver.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use dashmap::DashMap;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use ipnet::Ipv4Net;

use crate::classify::{FakeIpLookup, FakeIpMap};
use crate::error::DnsError;

use super::DnsAnswerSource;

/// Default TTL for fabricated answers.
pub const FAKE_TTL: Duration = Duration::from_secs(300);

/// Domain-to-fake-IP table with both lookup directions.
pub struct FakeDnsSource {
    range: Ipv4Net,
    ttl: Duration,
    by_domain: DashMap<String, Ipv4Addr>,
    by_ip: DashMap<Ipv4Addr, String>,
}

impl FakeDnsSource {
    #[must_use]
    pub fn new(range: Ipv4Net) -> Self {
        Self::with_ttl(range, FAKE_TTL)
    }

    #[must_use]
    pub fn with_ttl(range: Ipv4Net, ttl: Duration) -> Self {
        Self {
            range,
            ttl,
            by_domain: DashMap::new(),
            by_ip: DashMap::new(),
        }
    }

    /// Register `domain -> ip`. The address must lie in the configured
    /// range; both lookup directions are updated.
    pub fn insert(&self, domain: &str, ip: Ipv4Addr) -> Result<(), DnsError> {
        if !self.range.contains(&ip) {
            return Err(DnsError::OutOfRange(ip));
        }
        let name = normalize(domain);
        self.by_domain.insert(name.clone(), ip);
        self.by_ip.insert(ip, name);
        Ok(())
    }

    /// The fake IP registered for `domain`, if any.
    #[must_use]
    pub fn ip_for(&self, domain: &str) -> Option<Ipv4Addr> {
        self.by_domain.get(&normalize(domain)).map(|e| *e)
    }

    /// The configured fake range.
    #[must_use]
    pub fn range(&self) -> Ipv4Net {
        self.range
    }
}

/// Lowercase, no trailing dot.
fn normalize(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

fn into_response(msg: &mut Message) {
    msg.set_message_type(MessageType::Response);
    msg.set_response_code(ResponseCode::NoError);
    msg.set_recursion_available(true);
    msg.set_authoritative(false);
}

impl DnsAnswerSource for FakeDnsSource {
    fn apply(&self, msg: &mut Message) {
        if msg.message_type() != MessageType::Query || msg.op_code() != OpCode::Query {
            return;
        }
        let Some(query) = msg.queries().first().cloned() else {
            return;
        };
        if query.query_class() != DNSClass::IN {
            return;
        }
        let name = normalize(&query.name().to_ascii());
        match query.query_type() {
            RecordType::A => {
                let Some(ip) = self.by_domain.get(&name).map(|e| *e) else {
                    return;
                };
                let record = Record::from_rdata(
                    query.name().clone(),
                    self.ttl.as_secs() as u32,
                    RData::A(ip.into()),
                );
                msg.add_answer(record);
                into_response(msg);
            }
            RecordType::AAAA => {
                if self.by_domain.contains_key(&name) {
                    // Empty answer: force the host onto the A record.
                    into_response(msg);
                }
            }
            _ => {}
        }
    }
}

impl FakeIpMap for FakeDnsSource {
    fn lookup(&self, addr: IpAddr) -> FakeIpLookup {
        let IpAddr::V4(v4) = addr else {
            return FakeIpLookup::NotFake;
        };
        if !self.range.contains(&v4) {
            return FakeIpLookup::NotFake;
        }
        self.by_ip
            .get(&v4)
            .map_or(FakeIpLookup::NotFound, |e| {
                FakeIpLookup::Domain(e.value().clone())
            })
    }
}
