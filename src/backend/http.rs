//! HTTP transport to TKS/CA/DRM servlets.
//!
//! Transport security (client certificates, pinning) is configured on the
//! underlying `reqwest::Client` by the deployment, not here.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{BackendKind, BackendRequest, BackendResponse, BackendTransport};
use crate::types::{RaError, Result};

/// One HTTP endpoint of a backend pool.
pub struct HttpTransport {
    kind: BackendKind,
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with its own client and request timeout.
    pub fn new(kind: BackendKind, base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RaError::Configuration(format!("HTTP client setup failed: {e}")))?;
        Ok(Self::with_client(kind, base_url, client))
    }

    /// Create a transport sharing an existing client.
    pub fn with_client(kind: BackendKind, base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            kind,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url_for(&self, request: &BackendRequest) -> String {
        format!("{}/{}", self.base_url, request.op.path())
    }

    fn classify(&self, err: reqwest::Error) -> RaError {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            RaError::connection(self.kind, err.to_string())
        } else {
            RaError::ProtocolViolation(format!("{} exchange failed: {}", self.kind, err))
        }
    }
}

#[async_trait]
impl BackendTransport for HttpTransport {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, request: BackendRequest) -> Result<BackendResponse> {
        let url = self.url_for(&request);
        debug!(backend = %self.kind, url = %url, params = request.params.len(), "Sending backend request");

        let response = self
            .client
            .post(&url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(request.encode())
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(RaError::connection(
                self.kind,
                format!("{} answered HTTP {}", url, status),
            ));
        }
        if !status.is_success() {
            return Err(RaError::ProtocolViolation(format!(
                "{} answered HTTP {}",
                url, status
            )));
        }

        let body = response.text().await.map_err(|e| self.classify(e))?;
        BackendResponse::decode(&body)
    }
}
