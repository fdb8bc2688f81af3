//! Fallback pipeline: serve original bytes when transformation fails.
//!
//! The transform is always attempted first, even after earlier failures
//! (they may be transient). Only when it fails is the fallback namespace
//! consulted; a miss there fetches the origin directly, serves it with
//! diagnostic headers, and background-populates the namespace.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::kv::{CacheMetadata, KvStore};
use crate::response::{CacheOutcome, CachedResponse, HandlerResponse};
use crate::upstream::TransformClient;

/// Marker appended to the base key for the fallback namespace.
const FALLBACK_MARKER: &str = "?__fb=1";

#[must_use]
pub fn fallback_key(base_key: &str) -> String {
    format!("{base_key}{FALLBACK_MARKER}")
}

/// Diagnostic headers for a response that must not be cached downstream.
#[must_use]
pub fn no_store_headers(reason: &str, original_status: Option<u16>) -> Vec<(String, String)> {
    let mut headers = vec![
        ("x-fallback-applied".to_string(), "true".to_string()),
        ("x-fallback-reason".to_string(), reason.to_string()),
        ("cache-control".to_string(), "no-store".to_string()),
    ];
    if let Some(status) = original_status {
        headers.push(("x-original-status".to_string(), status.to_string()));
    }
    headers
}

pub struct FallbackPipeline {
    client: Arc<TransformClient>,
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl FallbackPipeline {
    #[must_use]
    pub fn new(client: Arc<TransformClient>, store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { client, store, ttl }
    }

    /// Serve the untransformed origin bytes after a transform failure.
    ///
    /// Consults the fallback namespace first; on a miss the origin is
    /// fetched, returned with `Cache-Control: no-store`, and stored into
    /// the namespace as a detached background task.
    pub async fn serve_original(
        &self,
        ctx: &RequestContext,
        base_key: &str,
        path: &str,
        origin_url: &str,
        reason: &str,
        original_status: Option<u16>,
    ) -> Result<HandlerResponse> {
        let key = fallback_key(base_key);

        match self.store.get(&key).await {
            Ok(Some(entry)) => {
                if let Some(cached) = CachedResponse::from_entry(entry) {
                    ctx.breadcrumb("fallback", format!("served from fallback cache: {key}"));
                    let mut extra_headers = no_store_headers(reason, original_status);
                    extra_headers
                        .push(("x-fallback-cache-hit".to_string(), "true".to_string()));
                    return Ok(HandlerResponse {
                        response: cached,
                        outcome: CacheOutcome::FallbackCacheHit,
                        extra_headers,
                    });
                }
            }
            Ok(None) => {}
            Err(err) => {
                // A broken fallback read behaves as a miss.
                tracing::warn!(key = %key, error = %err, "fallback namespace read failed");
            }
        }

        ctx.breadcrumb("fallback", format!("fetching origin: {origin_url}"));
        let origin = self.client.fetch_origin(origin_url).await?;
        if !origin.is_success() {
            return Err(Error::UpstreamTransform {
                status: origin.status,
                message: format!("origin returned {} for fallback fetch", origin.status),
            });
        }

        let metadata = CacheMetadata::new(
            origin.content_type(),
            origin.body.len() as u64,
            self.ttl.as_secs(),
            vec!["fallback:true".to_string(), format!("source:{path}")],
            0,
            Utc::now(),
        );
        let response = CachedResponse {
            status: origin.status,
            body: origin.body,
            metadata,
        };

        // Populate the fallback namespace outside the response path.
        let store = self.store.clone();
        let ttl = self.ttl;
        let stored = response.clone();
        ctx.detach(Box::pin(async move {
            let entry = stored.into_entry();
            if let Err(err) = store
                .put(&key, entry.body, entry.metadata, Some(ttl))
                .await
            {
                tracing::warn!(key = %key, error = %err, "fallback store failed");
            }
        }));

        Ok(HandlerResponse {
            response,
            outcome: CacheOutcome::Fallback,
            extra_headers: no_store_headers(reason, original_status),
        })
    }
}
