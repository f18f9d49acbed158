//! HTTP provisioning backend.
//!
//! Speaks a small JSON protocol to an external provisioning service:
//!
//! | Call                | Request body                 | Response body        |
//! |---------------------|------------------------------|----------------------|
//! | `POST /launch`      | [`LaunchRequest`]            | [`LaunchedInstance`] |
//! | `POST /terminate`   | `{node_id, instance_id}`     | ignored              |
//! | `GET /instances`    |                              | `["i-1", ...]`       |
//!
//! Launch and terminate carry an `idempotency-key` header set to the node
//! id. 408, 429 and 5xx responses and transport errors are retryable; any
//! other non-2xx is permanent.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use infergrid_health::probe_target;
use serde_json::json;
use tracing::debug;

use crate::provisioner::{LaunchRequest, LaunchedInstance, ProvisionError, Provisioner};

pub struct HttpProvisioner {
    address: String,
    prefix: String,
    timeout: Duration,
}

impl HttpProvisioner {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, ProvisionError> {
        let (address, prefix) = probe_target(endpoint)
            .ok_or_else(|| ProvisionError::Permanent(format!("unusable provisioner endpoint {endpoint}")))?;
        Ok(Self {
            address,
            prefix,
            timeout,
        })
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        idempotency_key: Option<&str>,
    ) -> Result<Bytes, ProvisionError> {
        let uri = format!("http://{}{}{path}", self.address, self.prefix);
        let result = tokio::time::timeout(self.timeout, async {
            let stream = tokio::net::TcpStream::connect(&self.address)
                .await
                .map_err(|e| ProvisionError::Retryable(format!("connect {}: {e}", self.address)))?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| ProvisionError::Retryable(format!("handshake: {e}")))?;
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let mut builder = http::Request::builder()
                .method(method)
                .uri(&uri)
                .header("host", &self.address)
                .header("user-agent", "infergrid-fleet/0.1")
                .header("content-type", "application/json");
            if let Some(key) = idempotency_key {
                builder = builder.header("idempotency-key", key);
            }
            let req = builder
                .body(Full::new(Bytes::from(body.unwrap_or_default())))
                .map_err(|e| ProvisionError::Permanent(format!("build request: {e}")))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| ProvisionError::Retryable(format!("send: {e}")))?;
            let status = resp.status();
            let bytes = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| ProvisionError::Retryable(format!("read body: {e}")))?
                .to_bytes();
            classify(status, bytes)
        })
        .await;

        result.unwrap_or_else(|_| {
            debug!(%uri, "provisioner call timed out");
            Err(ProvisionError::Retryable(format!("{uri} timed out")))
        })
    }
}

fn classify(status: StatusCode, body: Bytes) -> Result<Bytes, ProvisionError> {
    if status.is_success() {
        return Ok(body);
    }
    let text = String::from_utf8_lossy(&body);
    let message = format!("{status}: {}", text.trim());
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Err(ProvisionError::Retryable(message))
    } else {
        Err(ProvisionError::Permanent(message))
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ProvisionError> {
    serde_json::to_vec(value).map_err(|e| ProvisionError::Permanent(format!("encode: {e}")))
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchedInstance, ProvisionError> {
        let body = self
            .call(Method::POST, "/launch", Some(encode(request)?), Some(&request.node_id))
            .await?;
        serde_json::from_slice(&body)
            .map_err(|e| ProvisionError::Permanent(format!("malformed launch response: {e}")))
    }

    async fn terminate(&self, node_id: &str, instance_id: Option<&str>) -> Result<(), ProvisionError> {
        let body = encode(&json!({ "node_id": node_id, "instance_id": instance_id }))?;
        self.call(Method::POST, "/terminate", Some(body), Some(node_id))
            .await
            .map(|_| ())
    }

    async fn live_instances(&self) -> Result<HashSet<String>, ProvisionError> {
        let body = self.call(Method::GET, "/instances", None, None).await?;
        serde_json::from_slice(&body)
            .map_err(|e| ProvisionError::Permanent(format!("malformed instance list: {e}")))
    }
}
