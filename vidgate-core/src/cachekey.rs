//! Cache key construction and version management.
//!
//! The base key excludes the version; the version only ever perturbs the
//! transform URL (`v=<int>`) so downstream caching layers see a fresh URL
//! after a rebuild.

use std::sync::Arc;

use crate::kv::KvStore;
use crate::routing::normalize_path;
use crate::transform::TransformOptions;

const PRESIGNED_MARKER: &str = "X-Amz-Signature";

/// Stable base key: `video:{normalized path}:{sorted canonical options}`.
/// Reordering the option set yields the same key; the version never
/// appears.
#[must_use]
pub fn base_key(path: &str, options: &TransformOptions) -> String {
    let mut pairs = options.canonical_pairs();
    pairs.sort();
    let canonical = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("video:{}:{}", normalize_path(path), canonical)
}

/// Add or replace the `v` query parameter. Presigned URLs (any
/// `X-Amz-Signature` parameter) are never versioned and come back
/// unchanged.
#[must_use]
pub fn versioned_url(url: &str, version: u32) -> String {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (url, None),
    };

    let mut pairs: Vec<(String, String)> = Vec::new();
    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key == PRESIGNED_MARKER {
                return url.to_string();
            }
            if key == "v" {
                continue;
            }
            pairs.push((key.into_owned(), value.into_owned()));
        }
    }
    pairs.push(("v".to_string(), version.to_string()));

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in &pairs {
        serializer.append_pair(key, value);
    }
    format!("{base}?{}", serializer.finish())
}

/// Per-base-key monotonic counter over the versions namespace.
///
/// Advisory: no CAS, concurrent increments may skip integers. Failed reads
/// default to 1; failed writes degrade to a locally computed N+1.
pub struct VersionManager {
    store: Arc<dyn KvStore>,
}

impl VersionManager {
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn get_current(&self, base_key: &str) -> u32 {
        match self.store.get(base_key).await {
            Ok(Some(entry)) => std::str::from_utf8(&entry.body)
                .ok()
                .and_then(|raw| raw.trim().parse().ok())
                .unwrap_or(1),
            Ok(None) => 1,
            Err(err) => {
                tracing::warn!(key = %base_key, error = %err, "version read failed; assuming 1");
                1
            }
        }
    }

    /// Bump the counter after a miss. The new value is returned even when
    /// the write fails, so the rebuild still sees a fresh URL locally.
    pub async fn increment(&self, base_key: &str) -> u32 {
        let next = self.get_current(base_key).await + 1;
        let body = bytes::Bytes::from(next.to_string());
        if let Err(err) = self.store.put(base_key, body, None, None).await {
            tracing::warn!(
                key = %base_key,
                error = %err,
                version = next,
                "version write failed; using local value"
            );
        }
        next
    }
}
