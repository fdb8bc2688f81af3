//! Opportunistic TTL refresh for cached entries accessed mid-life.
//!
//! Always best-effort: refresh runs detached from the response path, and
//! no refresh failure ever reaches the client.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::config::CacheConfig;
use crate::error::StorageError;
use crate::kv::{CacheMetadata, KvStore};

#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    /// Refresh once this fraction of the TTL has elapsed.
    pub elapsed_fraction: f64,
    /// Never refresh with less than this much lifetime remaining.
    pub min_remaining: Duration,
    /// Bounded retries on backend rate limits.
    pub max_retries: usize,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            elapsed_fraction: 0.10,
            min_remaining: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

impl From<&CacheConfig> for RefreshPolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            elapsed_fraction: config.refresh_elapsed_fraction,
            min_remaining: Duration::from_secs(config.refresh_min_remaining_seconds),
            max_retries: config.refresh_max_retries,
        }
    }
}

/// Refresh only when enough of the TTL has elapsed AND enough lifetime
/// remains to make the write worthwhile.
#[must_use]
pub fn should_refresh(
    metadata: &CacheMetadata,
    now: DateTime<Utc>,
    policy: &RefreshPolicy,
) -> bool {
    if metadata.ttl_seconds == 0 {
        return false;
    }
    let elapsed_secs = (now - metadata.created_at).num_milliseconds() as f64 / 1000.0;
    let elapsed_fraction = elapsed_secs / metadata.ttl_seconds as f64;
    let remaining_secs = (metadata.expires_at - now).num_seconds();

    elapsed_fraction >= policy.elapsed_fraction
        && remaining_secs >= policy.min_remaining.as_secs() as i64
}

/// Rewrite the entry with `expires_at = now + ttl`, reusing the original
/// TTL. Rate-limit responses are retried with bounded exponential backoff;
/// any other failure is logged and dropped.
pub async fn refresh_entry(
    store: Arc<dyn KvStore>,
    key: String,
    body: Bytes,
    mut metadata: CacheMetadata,
    policy: RefreshPolicy,
) {
    let ttl = Duration::from_secs(metadata.ttl_seconds);
    metadata.expires_at = Utc::now() + chrono::Duration::seconds(metadata.ttl_seconds as i64);

    let attempt = || {
        let store = store.clone();
        let key = key.clone();
        let body = body.clone();
        let metadata = metadata.clone();
        async move { store.put(&key, body, Some(metadata), Some(ttl)).await }
    };

    let result = attempt
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(50))
                .with_max_times(policy.max_retries),
        )
        .when(|err: &StorageError| matches!(err, StorageError::RateLimited))
        .await;

    match result {
        Ok(()) => tracing::debug!(key = %key, "ttl refreshed"),
        Err(err) => tracing::warn!(key = %key, error = %err, "ttl refresh failed"),
    }
}
