//! Network rules: scheme and domain checks, private-address blocking, and
//! DNS pinning.
//!
//! When `deny_private_ips` is set the engine resolves the host itself and
//! hands the full address set to the tool as a [`PinnedHost`]. The tool
//! must connect to exactly those addresses — re-resolving at connect time
//! would reopen the DNS-rebinding window the pin exists to close.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use capsule_protocol::PolicyDecision;
use capsule_protocol::policy::HttpPolicy;
use serde_json::Value;
use tracing::debug;
use url::{Host, Url};

use crate::{PolicyEvalError, Verdict};

/// The addresses a host resolved to at evaluation time.
#[derive(Debug, Clone)]
pub struct PinnedHost {
    pub host: String,
    pub addrs: Vec<SocketAddr>,
}

/// Host resolution, injectable so tests can swap answers between calls.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>>;
}

/// System DNS through tokio's resolver.
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

pub(crate) async fn evaluate(
    rules: &HttpPolicy,
    args: &Value,
    resolver: &dyn Resolver,
) -> Result<Verdict, PolicyEvalError> {
    let Some(raw_url) = args.get("url").and_then(Value::as_str) else {
        return Ok(Verdict::plain(PolicyDecision::deny(
            "url argument is missing or not a string",
            "http.args",
        )));
    };

    let url = match Url::parse(raw_url) {
        Ok(url) => url,
        Err(err) => {
            return Ok(Verdict::plain(PolicyDecision::deny(
                format!("cannot parse url {raw_url:?}: {err}"),
                "http.args",
            )));
        }
    };

    if !matches!(url.scheme(), "http" | "https") {
        return Ok(Verdict::plain(PolicyDecision::deny(
            format!("scheme {:?} is not http or https", url.scheme()),
            "http.scheme",
        )));
    }

    // The url crate lowercases and punycodes the host, which covers the
    // case-insensitive, IDN-normalized matching requirement.
    let Some(host) = url.host() else {
        return Ok(Verdict::plain(PolicyDecision::deny(
            format!("url {raw_url:?} has no host"),
            "http.args",
        )));
    };
    let host_str = host.to_string();

    if !rules
        .allow_domains
        .iter()
        .any(|pattern| domain_matches(pattern, &host_str))
    {
        return Ok(Verdict::plain(PolicyDecision::deny(
            format!("host {host_str:?} matches no allow_domains pattern"),
            "http.allow_domains",
        )));
    }

    if !rules.deny_private_ips {
        return Ok(Verdict::plain(PolicyDecision::allow(
            "all network rules passed",
            "http.allow_domains",
        )));
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let addrs = match host {
        Host::Ipv4(ip) => vec![SocketAddr::new(IpAddr::V4(ip), port)],
        Host::Ipv6(ip) => vec![SocketAddr::new(IpAddr::V6(ip), port)],
        Host::Domain(domain) => match resolver.resolve(domain, port).await {
            Ok(addrs) => addrs,
            Err(err) => {
                return Ok(Verdict::plain(PolicyDecision::deny(
                    format!("cannot resolve host {domain:?}: {err}"),
                    "http.deny_private_ips",
                )));
            }
        },
    };

    if addrs.is_empty() {
        return Ok(Verdict::plain(PolicyDecision::deny(
            format!("host {host_str:?} resolved to no addresses"),
            "http.deny_private_ips",
        )));
    }

    for addr in &addrs {
        if is_blocked(addr.ip()) {
            return Ok(Verdict::plain(PolicyDecision::deny(
                format!(
                    "host {host_str:?} resolves to private or reserved address {}",
                    addr.ip()
                ),
                "http.deny_private_ips",
            )));
        }
    }

    debug!(host = %host_str, addrs = ?addrs, "host pinned to resolved addresses");
    Ok(Verdict::pinned(
        PolicyDecision::allow("all network rules passed", "http.allow_domains"),
        PinnedHost {
            host: host_str,
            addrs,
        },
    ))
}

/// `*` matches any host; `*.example.com` matches the apex and every
/// subdomain; anything else matches exactly.
fn domain_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host == suffix || host.ends_with(&pattern[1..]);
    }
    host == pattern
}

/// Blocked ranges: RFC 1918, loopback, link-local (cloud metadata lives
/// there), "this network", unique-local and link-local IPv6.
fn is_blocked(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            match octets[0] {
                0 | 10 | 127 => true,
                172 => (16..=31).contains(&octets[1]),
                192 => octets[1] == 168,
                169 => octets[1] == 254,
                _ => false,
            }
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_blocked(IpAddr::V4(mapped));
            }
            let segments = v6.segments();
            v6.is_loopback()
                || (segments[0] & 0xfe00) == 0xfc00
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}
