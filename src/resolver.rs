//! Target resolution: host or IPv4 literal to a concrete IPv4 address, plus a
//! best-effort reverse lookup used only for display.
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::net::lookup_host;
use tokio::time;
use tracing::debug;

use crate::error::{Result, ScanError};

/// Hostname reported when the reverse lookup yields nothing.
pub const UNKNOWN_HOSTNAME: &str = "Unknown";

const REVERSE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// A target string together with the IPv4 address it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub input: String,
    pub ip: Ipv4Addr,
}

impl ResolvedTarget {
    /// True when the caller supplied the address itself rather than a name.
    pub fn is_literal(&self) -> bool {
        self.input.trim() == self.ip.to_string()
    }
}

/// Resolve `target` to its first IPv4 address.
pub async fn resolve_target(target: &str) -> Result<ResolvedTarget> {
    let input = target.trim();
    if let Ok(ip) = input.parse::<Ipv4Addr>() {
        return Ok(ResolvedTarget { input: input.to_string(), ip });
    }
    let resolution_error = |reason: String| ScanError::Resolution {
        target: input.to_string(),
        reason,
    };
    if input.is_empty() || input.parse::<IpAddr>().is_ok() {
        // Empty input or an IPv6 literal; only IPv4 targets are scanned.
        return Err(resolution_error("not an IPv4 host".into()));
    }

    let addrs = lookup_host((input, 0))
        .await
        .map_err(|e| resolution_error(e.to_string()))?;
    let ip = addrs
        .filter_map(|sa| match sa.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| resolution_error("no IPv4 address found".into()))?;
    debug!(host = input, %ip, "resolved target");
    Ok(ResolvedTarget { input: input.to_string(), ip })
}

/// Display hostname for a resolved target.
///
/// A literal IP reports itself. A name reports the reverse lookup of its
/// address, or [`UNKNOWN_HOSTNAME`] when that fails.
pub async fn display_hostname(target: &ResolvedTarget) -> String {
    if target.is_literal() {
        return target.ip.to_string();
    }
    reverse_lookup(target.ip)
        .await
        .unwrap_or_else(|| UNKNOWN_HOSTNAME.to_string())
}

/// Reverse (PTR) lookup through the system resolver. Never fails, only yields `None`.
pub async fn reverse_lookup(ip: Ipv4Addr) -> Option<String> {
    let task = tokio::task::spawn_blocking(move || reverse_lookup_blocking(ip));
    match time::timeout(REVERSE_LOOKUP_TIMEOUT, task).await {
        Ok(Ok(name)) => name,
        Ok(Err(e)) => {
            debug!(%ip, error = %e, "reverse lookup task failed");
            None
        }
        Err(_) => {
            debug!(%ip, "reverse lookup timed out");
            None
        }
    }
}

fn reverse_lookup_blocking(ip: Ipv4Addr) -> Option<String> {
    match dns_lookup::lookup_addr(&IpAddr::V4(ip)) {
        Ok(name) => ptr_name(ip, name),
        Err(e) => {
            debug!(%ip, error = %e, "reverse lookup failed");
            None
        }
    }
}

/// The system resolver hands back the numeric form when no PTR record exists.
fn ptr_name(ip: Ipv4Addr, name: String) -> Option<String> {
    let name = name.trim_end_matches('.').to_string();
    if name.is_empty() || name.parse::<IpAddr>().is_ok() || name == ip.to_string() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_ipv4_resolves_to_itself() {
        let t = resolve_target(" 127.0.0.1 ").await.unwrap();
        assert_eq!(t.ip, Ipv4Addr::LOCALHOST);
        assert!(t.is_literal());
        assert_eq!(display_hostname(&t).await, "127.0.0.1");
    }

    #[tokio::test]
    async fn invalid_tld_fails_resolution() {
        let err = resolve_target("not-a-real-host.invalid").await.unwrap_err();
        assert!(matches!(err, ScanError::Resolution { .. }));
    }

    #[tokio::test]
    async fn ipv6_literal_is_rejected() {
        assert!(resolve_target("::1").await.is_err());
        assert!(resolve_target("").await.is_err());
    }

    #[test]
    fn numeric_reverse_answer_means_no_name() {
        let ip = Ipv4Addr::new(192, 0, 2, 7);
        assert_eq!(ptr_name(ip, "192.0.2.7".into()), None);
        assert_eq!(ptr_name(ip, String::new()), None);
        assert_eq!(
            ptr_name(ip, "host.example.net.".into()).as_deref(),
            Some("host.example.net")
        );
    }

    #[tokio::test]
    async fn loopback_reverse_lookup_returns_a_name_or_nothing() {
        if let Some(name) = reverse_lookup(Ipv4Addr::LOCALHOST).await {
            assert!(name.parse::<IpAddr>().is_err());
        }
    }

    #[tokio::test]
    async fn localhost_name_is_not_literal() {
        // "localhost" resolves through the hosts file even without DNS.
        if let Ok(t) = resolve_target("localhost").await {
            assert!(!t.is_literal());
            assert!(t.ip.is_loopback());
            assert!(!display_hostname(&t).await.is_empty());
        }
    }
}
