//! Runtime health probe against a node's inference endpoint.
//!
//! Each probe outcome goes straight to the safety monitor; consensus across
//! signals does the debouncing. [`ProbeBackoff`] only spaces out probes of
//! a node that keeps failing.

use std::time::Duration;

use http::Uri;
use tracing::debug;

const MAX_PROBE_BACKOFF: Duration = Duration::from_secs(60);

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (bad endpoint, connection error, timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(self) -> bool {
        self == ProbeResult::Healthy
    }
}

/// Probe interval for one node: doubled after every failed probe up to a
/// cap, back to the base interval after a healthy one.
#[derive(Debug, Clone, Copy)]
pub struct ProbeBackoff {
    base: Duration,
    current: Duration,
    max: Duration,
}

impl ProbeBackoff {
    pub fn new(interval: Duration) -> Self {
        Self {
            base: interval,
            current: interval,
            max: MAX_PROBE_BACKOFF.max(interval),
        }
    }

    /// Fold in a probe result; returns the delay before the next probe.
    pub fn record(&mut self, result: ProbeResult) -> Duration {
        self.current = if result.is_healthy() {
            self.base
        } else {
            (self.current * 2).min(self.max)
        };
        self.current
    }
}

/// Split a node endpoint (`http://host:port[/prefix]`) into the TCP
/// address to dial and the path prefix. A bare `host:port` is accepted.
pub fn probe_target(endpoint: &str) -> Option<(String, String)> {
    let uri: Uri = endpoint.parse().ok()?;
    if let Some(scheme) = uri.scheme_str() {
        if scheme != "http" {
            return None;
        }
    }
    let authority = uri.authority()?;
    let port = authority.port_u16().unwrap_or(80);
    let address = format!("{}:{port}", authority.host());
    let prefix = uri.path().trim_end_matches('/').to_string();
    Some((address, prefix))
}

/// Perform an HTTP GET of `path` on `endpoint`.
///
/// Returns `Healthy` for 2xx, `Unhealthy` for any other status, `Failed`
/// when the endpoint is unusable or the request does not complete within
/// `timeout`.
pub async fn http_probe(endpoint: &str, path: &str, timeout: Duration) -> ProbeResult {
    let Some((address, prefix)) = probe_target(endpoint) else {
        debug!(%endpoint, "probe skipped, endpoint is not a plain http address");
        return ProbeResult::Failed;
    };
    let uri = format!("http://{address}{prefix}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(&address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", &address)
            .header("user-agent", "infergrid-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "probe request could not be built");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "probe timed out");
        ProbeResult::Failed
    })
}
