//! Name resolution: overrides, system and recursive backends, Happy
//! Eyeballs candidate ordering.
//!
//! Overrides win over both backends. The system backend delegates to the
//! platform's getaddrinfo; the recursive backend queries A and AAAA in
//! parallel against recursive servers, honours TTLs, and caches positive
//! answers only.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver as HickoryResolver, TokioResolver};
use tracing::{debug, trace};

use crate::error::{Error, ErrorKind, Result};
use crate::signal::AbortSignal;

pub(crate) const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// One DNS override entry. Matching is case-sensitive exact on the host.
#[derive(Debug, Clone)]
pub struct DnsOverride {
    pub domain: String,
    /// IP literals, optionally with a `:port` suffix (bracketed IPv6
    /// accepted). A present port replaces the URL's port. Empty list blocks
    /// resolution with `DnsBlocked`.
    pub addresses: Vec<String>,
}

/// Starting-family tilt for Happy Eyeballs ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FamilyPreference {
    /// IPv6 first when any AAAA answer exists (RFC 8305 default).
    #[default]
    Auto,
    Ipv4,
    Ipv6,
}

/// Resolver configuration, part of the agent options.
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Use the platform resolver. When false, recursive lookups are
    /// performed against `servers` (or the system's configured upstreams).
    pub system: bool,
    pub overrides: Vec<DnsOverride>,
    /// Upstream recursive servers for the non-system backend.
    pub servers: Vec<SocketAddr>,
    pub prefer: FamilyPreference,
    /// Per-query budget; `DnsTimeout` once exceeded.
    pub query_timeout: Option<Duration>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            system: true,
            overrides: Vec::new(),
            servers: Vec::new(),
            prefer: FamilyPreference::default(),
            query_timeout: Some(DEFAULT_QUERY_TIMEOUT),
        }
    }
}

#[async_trait]
trait DnsBackend: Send + Sync {
    async fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>>;
}

/// Platform getaddrinfo. No caching inside the agent.
struct SystemDns;

#[async_trait]
impl DnsBackend for SystemDns {
    async fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::with_source(ErrorKind::DnsNotFound, format!("lookup {host} failed"), e))?
            .collect();
        Ok(addrs)
    }
}

/// Recursive lookups with TTL-honouring positive caching.
struct RecursiveDns {
    resolver: TokioResolver,
}

impl RecursiveDns {
    fn new(servers: &[SocketAddr]) -> Result<Self> {
        let mut builder = if servers.is_empty() {
            HickoryResolver::builder_tokio().map_err(|e| {
                Error::with_source(ErrorKind::DnsNotFound, "recursive resolver init failed", e)
            })?
        } else {
            let mut config = ResolverConfig::new();
            for server in servers {
                config.add_name_server(NameServerConfig::new(*server, Protocol::Udp));
            }
            HickoryResolver::builder_with_config(config, TokioConnectionProvider::default())
        };
        // positive answers only; NXDOMAIN and NODATA are never cached
        builder.options_mut().negative_min_ttl = Some(Duration::ZERO);
        builder.options_mut().negative_max_ttl = Some(Duration::ZERO);
        Ok(Self {
            resolver: builder.build(),
        })
    }
}

#[async_trait]
impl DnsBackend for RecursiveDns {
    async fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        // lookup_ip issues A and AAAA in parallel
        let answer = self.resolver.lookup_ip(host).await.map_err(|e| {
            Error::with_source(ErrorKind::DnsNotFound, format!("lookup {host} failed"), e)
        })?;
        Ok(answer.iter().map(|ip| SocketAddr::new(ip, port)).collect())
    }
}

/// Host-to-candidates resolution with overrides and HE ordering.
pub(crate) struct Resolver {
    overrides: Vec<DnsOverride>,
    prefer: FamilyPreference,
    query_timeout: Option<Duration>,
    backend: Box<dyn DnsBackend>,
}

impl Resolver {
    pub fn new(config: &DnsConfig) -> Result<Self> {
        let backend: Box<dyn DnsBackend> = if config.system {
            Box::new(SystemDns)
        } else {
            Box::new(RecursiveDns::new(&config.servers)?)
        };
        Ok(Self {
            overrides: config.overrides.clone(),
            prefer: config.prefer,
            query_timeout: config.query_timeout,
            backend,
        })
    }

    /// Resolve `host` into a non-empty, family-interleaved candidate list.
    pub async fn resolve(
        &self,
        host: &str,
        port: u16,
        signal: &AbortSignal,
    ) -> Result<Vec<SocketAddr>> {
        signal.check()?;

        if let Some(entry) = self.overrides.iter().find(|o| o.domain == host) {
            if entry.addresses.is_empty() {
                return Err(Error::new(
                    ErrorKind::DnsBlocked,
                    format!("resolution of {host} blocked by override"),
                ));
            }
            let mut addrs = Vec::with_capacity(entry.addresses.len());
            for raw in &entry.addresses {
                addrs.push(parse_override_address(raw, port)?);
            }
            debug!(host, count = addrs.len(), "resolved via override");
            return Ok(interleave(addrs, self.prefer));
        }

        // IP literals skip DNS entirely
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }
        if let Some(ip) = strip_brackets(host).and_then(|h| h.parse::<IpAddr>().ok()) {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let lookup = self.backend.lookup(host, port);
        let addrs = match self.query_timeout {
            Some(budget) => tokio::select! {
                res = tokio::time::timeout(budget, lookup) => res.map_err(|_| {
                    Error::new(ErrorKind::DnsTimeout, format!("lookup {host} exceeded {budget:?}"))
                })??,
                () = signal.cancelled() => {
                    return Err(Error::new(ErrorKind::Aborted, "request aborted"));
                }
            },
            None => tokio::select! {
                res = lookup => res?,
                () = signal.cancelled() => {
                    return Err(Error::new(ErrorKind::Aborted, "request aborted"));
                }
            },
        };

        if addrs.is_empty() {
            return Err(Error::new(
                ErrorKind::DnsNotFound,
                format!("no records for {host}"),
            ));
        }

        trace!(host, count = addrs.len(), "resolved");
        Ok(interleave(addrs, self.prefer))
    }
}

fn strip_brackets(host: &str) -> Option<&str> {
    host.strip_prefix('[').and_then(|h| h.strip_suffix(']'))
}

/// Parse an override address: IP literal with an optional `:port` suffix.
fn parse_override_address(raw: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    if let Some(inner) = strip_brackets(raw) {
        if let Ok(ip) = inner.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, default_port));
        }
    }
    Err(Error::new(
        ErrorKind::InvalidUrl,
        format!("invalid override address {raw:?}"),
    ))
}

/// RFC 8305 §4 ordering: alternate families, starting with IPv6 when any
/// AAAA answer exists (or as tilted by the preference).
fn interleave(addrs: Vec<SocketAddr>, prefer: FamilyPreference) -> Vec<SocketAddr> {
    let (v6, v4): (Vec<_>, Vec<_>) = addrs.into_iter().partition(|a| a.ip().is_ipv6());
    let six_first = match prefer {
        FamilyPreference::Auto | FamilyPreference::Ipv6 => !v6.is_empty(),
        FamilyPreference::Ipv4 => v4.is_empty(),
    };
    let (first, second) = if six_first { (v6, v4) } else { (v4, v6) };

    let mut out = Vec::with_capacity(first.len() + second.len());
    let mut a = first.into_iter();
    let mut b = second.into_iter();
    loop {
        match (a.next(), b.next()) {
            (None, None) => break,
            (x, y) => {
                out.extend(x);
                out.extend(y);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn override_blocks_with_empty_addresses() {
        let resolver = Resolver::new(&DnsConfig {
            overrides: vec![DnsOverride {
                domain: "blocked.tld".into(),
                addresses: vec![],
            }],
            ..DnsConfig::default()
        })
        .unwrap();
        let err = tokio_test::block_on(resolver.resolve("blocked.tld", 80, &AbortSignal::never()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DnsBlocked);
    }

    #[test]
    fn override_port_replaces_url_port() {
        let resolver = Resolver::new(&DnsConfig {
            overrides: vec![DnsOverride {
                domain: "example.tld".into(),
                addresses: vec!["127.0.0.1:9999".into()],
            }],
            ..DnsConfig::default()
        })
        .unwrap();
        let addrs = tokio_test::block_on(resolver.resolve("example.tld", 80, &AbortSignal::never()))
            .unwrap();
        assert_eq!(addrs, vec![v4("127.0.0.1:9999")]);
    }

    #[test]
    fn override_without_port_keeps_url_port() {
        let resolver = Resolver::new(&DnsConfig {
            overrides: vec![DnsOverride {
                domain: "example.tld".into(),
                addresses: vec!["10.0.0.1".into(), "[::2]:444".into()],
            }],
            ..DnsConfig::default()
        })
        .unwrap();
        let addrs = tokio_test::block_on(resolver.resolve("example.tld", 443, &AbortSignal::never()))
            .unwrap();
        // interleave starts v6 because an AAAA-style answer exists
        assert_eq!(addrs[0], "[::2]:444".parse().unwrap());
        assert_eq!(addrs[1], v4("10.0.0.1:443"));
    }

    #[test]
    fn override_matching_is_case_sensitive() {
        let resolver = Resolver::new(&DnsConfig {
            overrides: vec![DnsOverride {
                domain: "Example.tld".into(),
                addresses: vec![],
            }],
            ..DnsConfig::default()
        })
        .unwrap();
        // "example.tld" does not hit the override; an IP literal bypasses DNS
        let addrs = tokio_test::block_on(resolver.resolve("127.0.0.1", 80, &AbortSignal::never()))
            .unwrap();
        assert_eq!(addrs, vec![v4("127.0.0.1:80")]);
    }

    #[test]
    fn interleave_alternates_families() {
        let addrs = vec![
            v4("1.1.1.1:80"),
            v4("2.2.2.2:80"),
            "[2001:db8::1]:80".parse().unwrap(),
            "[2001:db8::2]:80".parse().unwrap(),
        ];
        let ordered = interleave(addrs, FamilyPreference::Auto);
        assert!(ordered[0].is_ipv6());
        assert!(ordered[1].is_ipv4());
        assert!(ordered[2].is_ipv6());
        assert!(ordered[3].is_ipv4());
    }

    #[test]
    fn interleave_honours_v4_preference() {
        let addrs = vec![v4("1.1.1.1:80"), "[2001:db8::1]:80".parse().unwrap()];
        let ordered = interleave(addrs, FamilyPreference::Ipv4);
        assert!(ordered[0].is_ipv4());
        assert!(ordered[1].is_ipv6());
    }

    #[test]
    fn ipv6_literal_hosts_resolve_directly() {
        let resolver = Resolver::new(&DnsConfig::default()).unwrap();
        let addrs = tokio_test::block_on(resolver.resolve("::1", 8080, &AbortSignal::never()))
            .unwrap();
        assert_eq!(addrs, vec!["[::1]:8080".parse().unwrap()]);
    }
}
