//! Upstream HTTP: the transformation endpoint and origin fetches.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;

use crate::config::MediaConfig;
use crate::error::{Error, Result};
use crate::transform::TransformLimits;

/// A fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn content_type(&self) -> Option<String> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// Error body as text, for limit mining and diagnostics.
    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Client for the transformation endpoint and origin servers. One shared
/// `reqwest::Client`; every fetch carries a deadline.
pub struct TransformClient {
    http: reqwest::Client,
    limits: Arc<TransformLimits>,
}

impl TransformClient {
    pub fn new(config: &MediaConfig, limits: Arc<TransformLimits>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.upstream_timeout_seconds))
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, limits })
    }

    /// Fetch a transformation URL. Non-2xx responses are returned as
    /// values (the orchestrator classifies them); their bodies are mined
    /// for limit declarations. Network failures and timeouts are errors.
    pub async fn fetch_transform(&self, url: &str) -> Result<UpstreamResponse> {
        let response = self.execute(url).await?;
        if !response.is_success() {
            let text = response.body_text();
            if self.limits.observe_error_message(&text) {
                tracing::debug!(url, status = response.status, "limits updated from error body");
            }
        }
        Ok(response)
    }

    /// Fetch original bytes straight from an origin.
    pub async fn fetch_origin(&self, url: &str) -> Result<UpstreamResponse> {
        self.execute(url).await
    }

    async fn execute(&self, url: &str) -> Result<UpstreamResponse> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("failed to read response body: {e}")))?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}
