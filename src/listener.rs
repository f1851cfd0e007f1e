//! Listener configuration and the accept-time policy filter (spec.md §6;
//! the filter algorithm itself is a supplemented feature, §10 of
//! SPEC_FULL.md, grounded on the accept-then-filter shape of `g3proxy`'s
//! `plain_tls_port` listener).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::TransportFactoryConfig;

/// `count` occurrences allowed per `per` duration, evaluated per remote IP.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimit {
    pub count: u32,
    #[serde(with = "duration_millis")]
    pub per: Duration,
}

mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// A CIDR block (`a.b.c.d/n`), parsed once at config-load time so the
/// accept-path filter is pure arithmetic, not string parsing.
#[derive(Debug, Clone, Copy)]
pub struct CidrBlock {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrBlock {
    pub fn parse(s: &str) -> Result<CidrBlock> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::config(format!("invalid CIDR block {s:?}: missing prefix length")))?;
        let network: IpAddr = addr
            .parse()
            .map_err(|e| Error::config(format!("invalid CIDR block {s:?}: {e}")))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|e| Error::config(format!("invalid CIDR block {s:?}: {e}")))?;
        let max_bits = if network.is_ipv4() { 32 } else { 128 };
        if prefix_len > max_bits {
            return Err(Error::config(format!("invalid CIDR block {s:?}: prefix too long")));
        }
        Ok(CidrBlock { network, prefix_len })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(a)) => {
                let mask = mask32(self.prefix_len);
                u32::from(net) & mask == u32::from(a) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(a)) => {
                let mask = mask128(self.prefix_len);
                u128::from(net) & mask == u128::from(a) & mask
            }
            _ => false,
        }
    }
}

fn mask32(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len as u32)
    }
}

fn mask128(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len as u32)
    }
}

/// Configuration for one listener: a bind address (TCP) or a Unix domain
/// socket path, mutually exclusive per spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub bind_addr: Option<SocketAddr>,
    #[cfg(unix)]
    pub unix_socket_path: Option<std::path::PathBuf>,
    pub transport: TransportFactoryConfig,
    pub max_connections_per_ip: Option<u32>,
    pub rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub allowed_networks: Vec<String>,
    #[serde(default)]
    pub blocked_networks: Vec<String>,
    pub idle_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub connection_timeout_ms: Option<u64>,
    /// When `transport.secure` is set, whether TLS activates immediately on
    /// accept (`false`, the default) or the listener starts plaintext and
    /// waits for the handler to call `start_tls()` itself (`true`, for
    /// protocols that negotiate encryption in-band, e.g. STARTTLS).
    #[serde(default)]
    pub starttls: bool,
}

/// The parsed, evaluable form of a [`ListenerConfig`]'s accept-time filter.
pub struct AcceptPolicy {
    max_connections_per_ip: Option<u32>,
    rate_limit: Option<RateLimit>,
    allowed: Vec<CidrBlock>,
    blocked: Vec<CidrBlock>,
    per_ip_counts: Mutex<HashMap<IpAddr, u32>>,
    rate_state: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Accept,
    Reject(&'static str),
}

impl AcceptPolicy {
    pub fn from_config(config: &ListenerConfig) -> Result<Arc<AcceptPolicy>> {
        let allowed = config
            .allowed_networks
            .iter()
            .map(|s| CidrBlock::parse(s))
            .collect::<Result<Vec<_>>>()?;
        let blocked = config
            .blocked_networks
            .iter()
            .map(|s| CidrBlock::parse(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Arc::new(AcceptPolicy {
            max_connections_per_ip: config.max_connections_per_ip,
            rate_limit: config.rate_limit,
            allowed,
            blocked,
            per_ip_counts: Mutex::new(HashMap::new()),
            rate_state: Mutex::new(HashMap::new()),
        }))
    }

    /// Evaluated by the `AcceptLoop` before constructing the endpoint.
    /// Rate-limit and CIDR rejects are silent at this layer; the caller
    /// logs at debug per spec.md §7.
    pub fn evaluate(&self, remote: SocketAddr) -> PolicyDecision {
        let ip = remote.ip();

        if !self.blocked.is_empty() && self.blocked.iter().any(|b| b.contains(ip)) {
            return PolicyDecision::Reject("blocked_networks");
        }
        if !self.allowed.is_empty() && !self.allowed.iter().any(|b| b.contains(ip)) {
            return PolicyDecision::Reject("allowed_networks");
        }
        if let Some(max) = self.max_connections_per_ip {
            let counts = self.per_ip_counts.lock().unwrap();
            if counts.get(&ip).copied().unwrap_or(0) >= max {
                return PolicyDecision::Reject("max_connections_per_ip");
            }
        }
        if let Some(limit) = self.rate_limit {
            let mut state = self.rate_state.lock().unwrap();
            let now = Instant::now();
            let entry = state.entry(ip).or_default();
            entry.retain(|t| now.duration_since(*t) < limit.per);
            if entry.len() as u32 >= limit.count {
                return PolicyDecision::Reject("rate_limit");
            }
            entry.push(now);
        }
        PolicyDecision::Accept
    }

    /// Called by the `AcceptLoop` once the endpoint is actually constructed.
    pub fn note_accepted(&self, remote: SocketAddr) {
        if self.max_connections_per_ip.is_some() {
            *self.per_ip_counts.lock().unwrap().entry(remote.ip()).or_insert(0) += 1;
        }
    }

    /// Called once the accepted endpoint disconnects.
    pub fn note_disconnected(&self, remote: SocketAddr) {
        if self.max_connections_per_ip.is_some() {
            if let Some(count) = self.per_ip_counts.lock().unwrap().get_mut(&remote.ip()) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_block_matches_expected_range() {
        let block = CidrBlock::parse("10.0.0.0/8").unwrap();
        assert!(block.contains("10.1.2.3".parse().unwrap()));
        assert!(!block.contains("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn blocked_network_rejects_before_allowed_check() {
        let config = ListenerConfig {
            bind_addr: Some("127.0.0.1:0".parse().unwrap()),
            #[cfg(unix)]
            unix_socket_path: None,
            transport: TransportFactoryConfig::default(),
            max_connections_per_ip: None,
            rate_limit: None,
            allowed_networks: vec!["0.0.0.0/0".into()],
            blocked_networks: vec!["10.0.0.0/8".into()],
            idle_timeout_ms: None,
            read_timeout_ms: None,
            connection_timeout_ms: None,
            starttls: false,
        };
        let policy = AcceptPolicy::from_config(&config).unwrap();
        let decision = policy.evaluate("10.1.1.1:4000".parse().unwrap());
        assert_eq!(decision, PolicyDecision::Reject("blocked_networks"));
    }

    #[test]
    fn rate_limit_rejects_after_count_exhausted() {
        let config = ListenerConfig {
            bind_addr: Some("127.0.0.1:0".parse().unwrap()),
            #[cfg(unix)]
            unix_socket_path: None,
            transport: TransportFactoryConfig::default(),
            max_connections_per_ip: None,
            rate_limit: Some(RateLimit {
                count: 2,
                per: Duration::from_secs(60),
            }),
            allowed_networks: vec![],
            blocked_networks: vec![],
            idle_timeout_ms: None,
            read_timeout_ms: None,
            connection_timeout_ms: None,
            starttls: false,
        };
        let policy = AcceptPolicy::from_config(&config).unwrap();
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(policy.evaluate(addr), PolicyDecision::Accept);
        assert_eq!(policy.evaluate(addr), PolicyDecision::Accept);
        assert_eq!(policy.evaluate(addr), PolicyDecision::Reject("rate_limit"));
    }
}
