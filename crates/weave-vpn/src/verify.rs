//! Connectivity Verification
//!
//! Sends one plain HTTP request through a userspace stack. Any HTTP
//! response proves the tunnel forwards traffic; the status code is not
//! inspected.

use crate::device::NetStack;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::header::{HOST, USER_AGENT};
use hyper::{Request, Uri};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tracing::{debug, info};

/// Probe target
pub const PROBE_URL: &str = "http://1.1.1.1:80/";

/// Probe through `stack`, failing if no response arrives within `timeout`
pub async fn verify_connectivity(stack: &dyn NetStack, timeout: Duration) -> Result<(), VerifyError> {
    verify_url(stack, PROBE_URL, timeout).await
}

pub(crate) async fn verify_url(stack: &dyn NetStack, url: &str, timeout: Duration) -> Result<(), VerifyError> {
    let uri: Uri = url.parse()
        .map_err(|e: hyper::http::uri::InvalidUri| VerifyError::InvalidUrl(e.to_string()))?;
    let host = uri.host()
        .ok_or_else(|| VerifyError::InvalidUrl("no host in URL".into()))?
        .to_string();
    let port = uri.port_u16().unwrap_or(80);

    let started = std::time::Instant::now();
    let status = tokio::time::timeout(timeout, probe(stack, uri, &host, port)).await
        .map_err(|_| VerifyError::Timeout(timeout))??;

    info!(status = status.as_u16(), elapsed = ?started.elapsed(), "connectivity test passed");
    Ok(())
}

async fn probe(
    stack: &dyn NetStack,
    uri: Uri,
    host: &str,
    port: u16,
) -> Result<hyper::StatusCode, VerifyError> {
    let stream = stack.dial_tcp(host, port).await
        .map_err(|e| VerifyError::Dial(e.to_string()))?;

    let (mut sender, conn) = http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream)).await
        .map_err(|e| VerifyError::Http(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("probe connection closed: {}", e);
        }
    });

    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/").to_string();
    let request = Request::get(path)
        .header(HOST, host)
        .header(USER_AGENT, concat!("weave/", env!("CARGO_PKG_VERSION")))
        .body(Empty::new())
        .map_err(|e| VerifyError::Http(e.to_string()))?;

    let response = sender.send_request(request).await
        .map_err(|e| VerifyError::Http(e.to_string()))?;

    Ok(response.status())
}

/// Connectivity errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum VerifyError {
    #[error("invalid probe URL: {0}")]
    InvalidUrl(String),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("HTTP probe failed: {0}")]
    Http(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),
}
