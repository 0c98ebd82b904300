use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use url::{Host, Url};

use crate::executor::ToolError;

const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

/// SSRF guard for outbound fetches: scheme allow-list plus a resolved-address check.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkGuard;

impl NetworkGuard {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Checks that need no network: scheme, host presence, literal IPs and `localhost`.
    ///
    /// # Errors
    ///
    /// Returns `ToolError::NetworkBlocked` describing the first failed check.
    pub fn check_syntax(&self, raw: &str) -> Result<Url, ToolError> {
        let parsed = Url::parse(raw).map_err(|e| blocked(raw, format!("invalid url: {e}")))?;
        if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
            return Err(blocked(raw, format!("scheme not allowed: {}", parsed.scheme())));
        }
        match parsed.host() {
            None => return Err(blocked(raw, "missing host")),
            Some(Host::Domain(d)) => {
                let d = d.trim_end_matches('.').to_ascii_lowercase();
                if d == "localhost" || d.ends_with(".localhost") {
                    return Err(blocked(raw, "localhost"));
                }
            }
            Some(Host::Ipv4(v4)) => {
                if is_private_ip(IpAddr::V4(v4)) {
                    return Err(blocked(raw, format!("private address {v4}")));
                }
            }
            Some(Host::Ipv6(v6)) => {
                if is_private_ip(IpAddr::V6(v6)) {
                    return Err(blocked(raw, format!("private address {v6}")));
                }
            }
        }
        Ok(parsed)
    }

    /// Full check: syntax, then DNS resolution with every resolved address vetted.
    ///
    /// # Errors
    ///
    /// Returns `ToolError::NetworkBlocked` for a disallowed scheme, an unresolvable
    /// host, or any resolved address in a private range.
    pub async fn check_url(&self, raw: &str) -> Result<Url, ToolError> {
        Ok(self.resolve(raw).await?.url)
    }

    /// Like [`Self::check_url`], but also returns the vetted addresses so the
    /// caller can connect to exactly those and skip a second lookup.
    ///
    /// # Errors
    ///
    /// Same as [`Self::check_url`].
    pub async fn resolve(&self, raw: &str) -> Result<ResolvedUrl, ToolError> {
        let url = self.check_syntax(raw)?;
        let Some(Host::Domain(host)) = url.host() else {
            return Ok(ResolvedUrl { url, addrs: Vec::new() });
        };
        let port = url.port_or_known_default().unwrap_or(443);

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| blocked(raw, format!("dns resolution failed: {e}")))?
            .collect();
        vet_resolved(raw, &addrs)?;
        Ok(ResolvedUrl { url, addrs })
    }
}

/// A URL that passed [`NetworkGuard`], with the public addresses its host
/// resolved to. `addrs` is empty when the host is a literal IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUrl {
    pub url: Url,
    pub addrs: Vec<SocketAddr>,
}

impl ResolvedUrl {
    /// Domain to pin to `addrs`, if the host was a name.
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.url.domain().filter(|_| !self.addrs.is_empty())
    }
}

/// Reject an empty resolution or any address in a private range.
///
/// # Errors
///
/// Returns `ToolError::NetworkBlocked` naming the first offending address.
pub fn vet_resolved(raw: &str, addrs: &[SocketAddr]) -> Result<(), ToolError> {
    if addrs.is_empty() {
        return Err(blocked(raw, "host did not resolve"));
    }
    if let Some(addr) = addrs.iter().find(|a| is_private_ip(a.ip())) {
        tracing::warn!(url = raw, addr = %addr.ip(), "fetch blocked: private address");
        return Err(blocked(raw, format!("resolves to private address {}", addr.ip())));
    }
    Ok(())
}

fn blocked(url: &str, reason: impl Into<String>) -> ToolError {
    ToolError::NetworkBlocked {
        url: url.to_owned(),
        reason: reason.into(),
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback()              // 127.0.0.0/8
        || ip.is_private()        // 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
        || ip.is_link_local()     // 169.254.0.0/16
        || ip.is_unspecified()    // 0.0.0.0
        || ip.is_broadcast()
}

#[must_use]
pub fn is_private_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(ip) => is_private_v4(ip),
        IpAddr::V6(ip) => {
            ip.is_loopback()
                || ip.is_unspecified()
                || ip.to_ipv4_mapped().is_some_and(is_private_v4)
                || (ip.segments()[0] & 0xfe00) == 0xfc00 // fc00::/7 unique local
                || (ip.segments()[0] & 0xffc0) == 0xfe80 // fe80::/10 link-local
        }
    }
}
