//! SSRF validation for upstream targets
//!
//! Candidate upstream URLs are checked before they are installed into the
//! route table: scheme must be http(s), the hostname must not be a known
//! metadata name, and every address the host resolves to must fall outside
//! the deny-set. Resolution happens once, at install time; the resolved set
//! is recorded next to the route. This is deliberately not re-checked at
//! forward time, so a DNS rebind after install is not caught (operator
//! trade-off, same posture as blocking only at config load).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::net::lookup_host;
use url::Url;

use crate::config::SsrfConfig;

/// Hostnames that are rejected on sight, before any resolution.
const METADATA_HOSTNAMES: &[&str] = &[
    "localhost",
    "metadata.google.internal",
    "169.254.169.254",
];

/// Reason a candidate upstream URL was rejected.
#[derive(Debug, Error)]
pub enum SsrfRejection {
    #[error("invalid URL: {0}")]
    Malformed(String),

    #[error("scheme '{0}' not allowed, only http/https")]
    Scheme(String),

    #[error("URL must not carry a query or fragment")]
    QueryOrFragment,

    #[error("URL must contain a hostname")]
    MissingHost,

    #[error("blocked hostname: {0}")]
    BlockedHostname(String),

    #[error("unable to resolve {0}: {1}")]
    Resolution(String, String),

    #[error("{0} resolves to blocked address {1}")]
    BlockedAddress(String, IpAddr),
}

/// Validates upstream URLs against the configured deny-set.
pub struct SsrfValidator {
    allow_private: bool,
    extra_blocked_hostnames: Vec<String>,
}

impl SsrfValidator {
    pub fn new(config: &SsrfConfig) -> Self {
        Self {
            allow_private: config.allow_private,
            extra_blocked_hostnames: config
                .blocked_hostnames
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Validate a candidate upstream URL, returning the resolved address set.
    pub async fn validate(&self, url: &Url) -> Result<Vec<IpAddr>, SsrfRejection> {
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(SsrfRejection::Scheme(other.to_string())),
        }

        if url.query().is_some() || url.fragment().is_some() {
            return Err(SsrfRejection::QueryOrFragment);
        }

        let host = url.host_str().ok_or(SsrfRejection::MissingHost)?;
        let host_lower = host.to_ascii_lowercase();

        for blocked in METADATA_HOSTNAMES
            .iter()
            .map(|h| *h)
            .chain(self.extra_blocked_hostnames.iter().map(String::as_str))
        {
            if host_lower.contains(blocked) {
                return Err(SsrfRejection::BlockedHostname(host.to_string()));
            }
        }

        let addrs = self.resolve(url, host).await?;

        for addr in &addrs {
            if self.is_denied(*addr) {
                return Err(SsrfRejection::BlockedAddress(host.to_string(), *addr));
            }
        }

        Ok(addrs)
    }

    /// Resolve the host to its address set. IP literals short-circuit DNS.
    async fn resolve(&self, url: &Url, host: &str) -> Result<Vec<IpAddr>, SsrfRejection> {
        if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let port = url.port_or_known_default().unwrap_or(80);
        let addrs: Vec<IpAddr> = lookup_host((host, port))
            .await
            .map_err(|e| SsrfRejection::Resolution(host.to_string(), e.to_string()))?
            .map(|sa| sa.ip())
            .collect();

        if addrs.is_empty() {
            return Err(SsrfRejection::Resolution(
                host.to_string(),
                "no addresses".to_string(),
            ));
        }

        Ok(addrs)
    }

    /// Deny-set membership check for a single resolved address.
    fn is_denied(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self.is_denied_v4(v4),
            IpAddr::V6(v6) => {
                // IPv4-mapped addresses are judged by their embedded v4
                if let Some(mapped) = v6.to_ipv4_mapped() {
                    return self.is_denied_v4(mapped);
                }
                self.is_denied_v6(v6)
            }
        }
    }

    fn is_denied_v4(&self, addr: Ipv4Addr) -> bool {
        let octets = addr.octets();
        let always = addr.is_loopback()               // 127.0.0.0/8
            || addr.is_link_local()                   // 169.254.0.0/16
            || octets[0] == 0                         // 0.0.0.0/8 "this network"
            || addr.is_multicast()                    // 224.0.0.0/4
            || octets[0] >= 240; // 240.0.0.0/4 reserved
        if always {
            return true;
        }
        if self.allow_private {
            return false;
        }
        addr.is_private() // 10/8, 172.16/12, 192.168/16
    }

    fn is_denied_v6(&self, addr: Ipv6Addr) -> bool {
        let seg = addr.segments();
        let always = addr.is_loopback()               // ::1
            || addr.is_unspecified()
            || (seg[0] & 0xffc0) == 0xfe80            // fe80::/10 link-local
            || addr.is_multicast(); // ff00::/8
        if always {
            return true;
        }
        if self.allow_private {
            return false;
        }
        (seg[0] & 0xfe00) == 0xfc00 // fc00::/7 unique-local
    }
}
