//! Next-hop resolution
//!
//! [`resolve_target`] turns a request-URI into a socket address the way
//! RFC 3263 suggests, minus NAPTR: a literal address or an explicit port goes
//! straight to an address lookup, otherwise the SRV record for the requested
//! transport is tried first and a plain A/AAAA lookup is the last resort. The
//! whole SRV list is kept so the transaction can fail over along it.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use tracing::debug;

use crate::error::{B2bError, Result};
use crate::message::SipUri;
use crate::transport::Transport;

/// An SRV record with its target already resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    pub priority: u16,
    pub weight: u16,
    pub address: IpAddr,
    pub port: u16,
}

impl SrvTarget {
    pub fn new(priority: u16, weight: u16, address: IpAddr, port: u16) -> Self {
        Self {
            priority,
            weight,
            address,
            port,
        }
    }
}

/// Priority ascending, then weight descending
pub fn sort_srv(targets: &mut [SrvTarget]) {
    targets.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
}

#[async_trait]
pub trait Resolver: Send + Sync {
    /// Sorted SRV targets for `name`, empty when there are none
    async fn lookup_srv(&self, name: &str) -> Vec<SrvTarget>;

    /// Addresses for `host`; literal addresses resolve to themselves
    async fn lookup_host(&self, host: &str) -> Vec<IpAddr>;
}

fn literal(host: &str) -> Option<IpAddr> {
    host.trim_start_matches('[').trim_end_matches(']').parse().ok()
}

/// Resolver backed by the system DNS configuration
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn from_system_conf() -> Result<Self> {
        let inner = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| B2bError::unresolvable(format!("system resolver configuration: {e}")))?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_srv(&self, name: &str) -> Vec<SrvTarget> {
        let lookup = match self.inner.srv_lookup(name).await {
            Ok(lookup) => lookup,
            Err(e) => {
                debug!(name, error = %e, "SRV lookup failed");
                return Vec::new();
            }
        };
        let records: Vec<(u16, u16, u16, String)> = lookup
            .iter()
            .map(|srv| (srv.priority(), srv.weight(), srv.port(), srv.target().to_utf8()))
            .collect();

        let resolved =
            futures::future::join_all(records.iter().map(|(_, _, _, target)| self.lookup_host(target))).await;

        let mut targets: Vec<SrvTarget> = records
            .into_iter()
            .zip(resolved)
            .filter_map(|((priority, weight, port, _), addresses)| {
                addresses
                    .first()
                    .map(|address| SrvTarget::new(priority, weight, *address, port))
            })
            .collect();
        sort_srv(&mut targets);
        targets
    }

    async fn lookup_host(&self, host: &str) -> Vec<IpAddr> {
        if let Some(ip) = literal(host) {
            return vec![ip];
        }
        match self.inner.lookup_ip(host).await {
            Ok(lookup) => lookup.iter().collect(),
            Err(e) => {
                debug!(host, error = %e, "host lookup failed");
                Vec::new()
            }
        }
    }
}

/// Fixed answers, for tests and statically provisioned peers
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    srv: HashMap<String, Vec<SrvTarget>>,
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_srv(mut self, name: &str, targets: Vec<SrvTarget>) -> Self {
        self.srv.insert(name.to_ascii_lowercase(), targets);
        self
    }

    pub fn with_host(mut self, host: &str, addresses: Vec<IpAddr>) -> Self {
        self.hosts.insert(host.to_ascii_lowercase(), addresses);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn lookup_srv(&self, name: &str) -> Vec<SrvTarget> {
        let mut targets = self.srv.get(&name.to_ascii_lowercase()).cloned().unwrap_or_default();
        sort_srv(&mut targets);
        targets
    }

    async fn lookup_host(&self, host: &str) -> Vec<IpAddr> {
        if let Some(ip) = literal(host) {
            return vec![ip];
        }
        self.hosts.get(&host.to_ascii_lowercase()).cloned().unwrap_or_default()
    }
}

/// A resolved next hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub target: SocketAddr,
    pub transport: Transport,
    /// Every candidate of the chosen transport, `target` first
    pub candidates: Vec<SocketAddr>,
}

/// Resolve the next hop for `uri`.
///
/// `requested` is the transport chosen by routing; without one the URI's
/// `transport` parameter applies, then UDP.
pub async fn resolve_target(
    resolver: &dyn Resolver,
    uri: &SipUri,
    requested: Option<Transport>,
) -> Result<ResolvedTarget> {
    let transport = requested.or_else(|| uri.transport()).unwrap_or_default();
    let secure = uri.is_secure();

    if uri.port.is_none() && literal(&uri.host).is_none() {
        debug!(host = %uri.host, "Resolving host");
        for candidate in Transport::SRV_ORDER {
            let wanted = match candidate {
                Transport::Tls => transport == Transport::Tls || secure,
                other => transport == other && !secure,
            };
            if !wanted {
                continue;
            }
            let name = candidate.srv_name(&uri.host);
            let records = resolver.lookup_srv(&name).await;
            let candidates: Vec<SocketAddr> = records
                .iter()
                .map(|r| {
                    let port = if r.port == 0 { candidate.default_port() } else { r.port };
                    SocketAddr::new(r.address, port)
                })
                .collect();
            match candidates.first() {
                Some(&target) => {
                    debug!(srv = %name, %target, "DNS/SRV resolved");
                    return Ok(ResolvedTarget {
                        target,
                        transport: candidate,
                        candidates,
                    });
                }
                None => debug!(srv = %name, "DNS/SRV not found"),
            }
        }
    }

    let address = resolver
        .lookup_host(&uri.host)
        .await
        .into_iter()
        .next()
        .ok_or_else(|| B2bError::unresolvable(uri.host.clone()))?;
    // sips and TLS default to 5061
    let transport = if secure { Transport::Tls } else { transport };
    let target = SocketAddr::new(address, uri.port.unwrap_or(transport.default_port()));
    debug!(host = %uri.host, %target, "FQDN resolved");
    Ok(ResolvedTarget {
        target,
        transport,
        candidates: vec![target],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn resolver() -> StaticResolver {
        StaticResolver::new()
            .with_srv(
                "_sip._udp.example.com",
                vec![
                    SrvTarget::new(20, 0, ip("192.0.2.30"), 5060),
                    SrvTarget::new(10, 5, ip("192.0.2.11"), 0),
                    SrvTarget::new(10, 50, ip("192.0.2.10"), 5070),
                ],
            )
            .with_srv("_sip._tls.example.com", vec![SrvTarget::new(1, 1, ip("192.0.2.50"), 0)])
            .with_host("example.com", vec![ip("192.0.2.99")])
            .with_host("plain.example.net", vec![ip("198.51.100.7")])
    }

    #[tokio::test]
    async fn test_srv_ordering() {
        let uri = SipUri::parse("sip:bob@example.com").unwrap();
        let resolved = resolve_target(&resolver(), &uri, None).await.unwrap();
        assert_eq!(resolved.transport, Transport::Udp);
        assert_eq!(
            resolved.candidates,
            vec![
                "192.0.2.10:5070".parse().unwrap(),
                "192.0.2.11:5060".parse().unwrap(),
                "192.0.2.30:5060".parse().unwrap(),
            ]
        );
        assert_eq!(resolved.target, resolved.candidates[0]);
    }

    #[tokio::test]
    async fn test_sips_uses_tls_records() {
        let uri = SipUri::parse("sips:bob@example.com").unwrap();
        let resolved = resolve_target(&resolver(), &uri, None).await.unwrap();
        assert_eq!(resolved.transport, Transport::Tls);
        assert_eq!(resolved.target, "192.0.2.50:5061".parse().unwrap());
    }

    #[tokio::test]
    async fn test_fallbacks() {
        let resolver = resolver();

        // explicit port skips SRV
        let uri = SipUri::parse("sip:bob@example.com:5080").unwrap();
        let resolved = resolve_target(&resolver, &uri, None).await.unwrap();
        assert_eq!(resolved.target, "192.0.2.99:5080".parse().unwrap());

        // no SRV for the transport falls back to A
        let uri = SipUri::parse("sip:bob@plain.example.net").unwrap();
        let resolved = resolve_target(&resolver, &uri, Some(Transport::Tcp)).await.unwrap();
        assert_eq!(resolved.target, "198.51.100.7:5060".parse().unwrap());
        assert_eq!(resolved.transport, Transport::Tcp);

        let uri = SipUri::parse("sips:bob@plain.example.net").unwrap();
        let resolved = resolve_target(&resolver, &uri, None).await.unwrap();
        assert_eq!(resolved.target, "198.51.100.7:5061".parse().unwrap());
        assert_eq!(resolved.transport, Transport::Tls);

        let uri = SipUri::parse("sip:10.1.1.2").unwrap();
        let resolved = resolve_target(&resolver, &uri, Some(Transport::Tls)).await.unwrap();
        assert_eq!(resolved.target, "10.1.1.2:5061".parse().unwrap());

        let uri = SipUri::parse("sip:10.1.1.1").unwrap();
        let resolved = resolve_target(&resolver, &uri, None).await.unwrap();
        assert_eq!(resolved.candidates, vec!["10.1.1.1:5060".parse().unwrap()]);

        let uri = SipUri::parse("sip:bob@nowhere.invalid").unwrap();
        let err = resolve_target(&resolver, &uri, None).await.unwrap_err();
        assert!(matches!(err, B2bError::UnresolvableTarget { .. }));
    }
}
