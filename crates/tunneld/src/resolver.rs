//! Hostname resolution through the operating system's resolver.

use std::net::IpAddr;

use anyhow::{ensure, Context, Result};
use tokio::net;

/// Resolve a hostname to the first address returned by the system resolver.
///
/// No preference is applied between IPv4 and IPv6 beyond the resolver's own
/// ordering. Resolution happens once per rule at startup; the engine never
/// re-resolves a hostname while it is running.
pub async fn resolve_first(host: &str) -> Result<IpAddr> {
    ensure!(!host.is_empty(), "hostname is empty");
    let mut addrs = net::lookup_host((host, 0u16))
        .await
        .with_context(|| format!("failed to resolve hostname {host:?}"))?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .with_context(|| format!("hostname {host:?} did not resolve to any address"))
}
