//! Target URL validation (SSRF protection).
//!
//! A URL is only scraped when it uses http(s) and every address its host
//! resolves to is publicly routable.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

#[async_trait]
pub trait UrlGuard: Send + Sync {
    async fn is_safe(&self, url: &str) -> bool;
}

/// Resolves the host with the system resolver and rejects non-public ranges.
#[derive(Debug, Default, Clone, Copy)]
pub struct PublicUrlGuard;

#[async_trait]
impl UrlGuard for PublicUrlGuard {
    async fn is_safe(&self, url: &str) -> bool {
        is_safe_public_url(url).await
    }
}

pub async fn is_safe_public_url(target: &str) -> bool {
    let Ok(url) = Url::parse(target) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }

    let port = url.port_or_known_default().unwrap_or(80);
    match url.host() {
        Some(Host::Ipv4(ip)) => is_public_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => is_public_ip(IpAddr::V6(ip)),
        Some(Host::Domain(domain)) => {
            if is_localhost_domain(domain) {
                return false;
            }
            match tokio::net::lookup_host((domain, port)).await {
                Ok(addrs) => {
                    let addrs: Vec<_> = addrs.collect();
                    !addrs.is_empty() && addrs.iter().all(|a| is_public_ip(a.ip()))
                }
                Err(e) => {
                    log::debug!("DNS lookup failed for {}: {}", domain, e);
                    false
                }
            }
        }
        None => false,
    }
}

pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !is_reserved_ipv4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return !is_reserved_ipv4(mapped);
            }
            !is_reserved_ipv6(v6)
        }
    }
}

fn is_reserved_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_documentation()
        // 0.0.0.0/8
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (64..=127).contains(&b))
        // 240.0.0.0/4
        || a >= 240
}

fn is_reserved_ipv6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}

fn is_localhost_domain(domain: &str) -> bool {
    let d = domain.trim_end_matches('.').to_lowercase();
    d == "localhost" || d == "localhost.localdomain" || d.ends_with(".localhost")
}
