//! Endpoint Selection
//!
//! Produces the ordered candidate list the pipelines draw their
//! endpoints from. Scanner order is authoritative.

use crate::config::ScanOptions;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One reachable candidate reported by a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanResult {
    pub addr: SocketAddr,
    /// Round-trip time, when the scanner measures one
    pub rtt: Option<Duration>,
}

/// Endpoint liveness scanner
#[async_trait]
pub trait EndpointScanner: Send + Sync {
    /// Return reachable candidates, best first
    async fn scan(&self, ctx: &CancellationToken, opts: &ScanOptions) -> Result<Vec<ScanResult>, ScanError>;
}

/// Scanner that keeps every candidate that resolves within the timeout
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveScanner;

#[async_trait]
impl EndpointScanner for ResolveScanner {
    async fn scan(&self, ctx: &CancellationToken, opts: &ScanOptions) -> Result<Vec<ScanResult>, ScanError> {
        let mut results = Vec::new();

        for candidate in &opts.candidates {
            if results.len() >= opts.max_results {
                break;
            }

            let lookup = tokio::time::timeout(opts.timeout(), tokio::net::lookup_host(candidate.as_str()));
            let resolved = tokio::select! {
                r = lookup => r,
                _ = ctx.cancelled() => return Err(ScanError::Cancelled),
            };

            match resolved {
                Ok(Ok(mut addrs)) => {
                    if let Some(addr) = addrs.next() {
                        results.push(ScanResult { addr, rtt: None });
                    }
                }
                Ok(Err(e)) => debug!(candidate = %candidate, error = %e, "candidate did not resolve"),
                Err(_) => debug!(candidate = %candidate, "candidate timed out"),
            }
        }

        if results.is_empty() {
            return Err(ScanError::NoneReachable);
        }

        Ok(results)
    }
}

/// Build the candidate endpoint list
///
/// Without scanning the configured endpoint is returned twice, so modes
/// that look at a second slot always find one.
pub async fn select_endpoints(
    ctx: &CancellationToken,
    endpoint: &str,
    scan: Option<&ScanOptions>,
    scanner: &dyn EndpointScanner,
) -> Result<Vec<String>, ScanError> {
    let Some(opts) = scan else {
        return Ok(vec![endpoint.to_string(), endpoint.to_string()]);
    };

    let results = scanner.scan(ctx, opts).await?;
    if results.is_empty() {
        return Err(ScanError::NoneReachable);
    }
    info!(?results, "scan results");

    Ok(results.iter().map(|r| r.addr.to_string()).collect())
}

/// Scan errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScanError {
    #[error("no reachable endpoint found")]
    NoneReachable,

    #[error("scan cancelled")]
    Cancelled,

    #[error("scan failed: {0}")]
    Failed(String),
}
