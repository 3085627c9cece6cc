use crate::utils::error::{ProxyError, Result};
use std::net::{IpAddr, SocketAddr};
use tracing::instrument;

/// Resolve an origin host into a list of candidate socket addresses,
/// preferring IPv6 entries first while preserving order inside each family.
#[instrument(level = "debug", fields(host = host, port = port))]
pub async fn resolve_host(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let mut targets: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ProxyError::UpstreamResolution(format!("{host}: {e}")))?
        .collect();

    targets.sort_by_key(|addr| match addr.ip() {
        IpAddr::V6(_) => 0,
        IpAddr::V4(_) => 1,
    });

    if targets.is_empty() {
        return Err(ProxyError::UpstreamResolution(format!(
            "no addresses found for {host}"
        )));
    }

    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_localhost() {
        let resolved = resolve_host("localhost", 8080).await.unwrap();
        assert!(!resolved.is_empty());
        assert!(resolved.iter().all(|addr| addr.port() == 8080));
    }

    #[tokio::test]
    async fn unresolvable_host_errors() {
        let result = resolve_host("this-host-does-not-exist.invalid", 80).await;
        assert!(result.is_err());
    }
}
