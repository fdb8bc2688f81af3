//! Response value types shared by the cache pipeline.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::kv::{CacheMetadata, KvEntry};

/// Where a served response came from, reported via `X-Cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
    Bypass,
    Fallback,
    FallbackCacheHit,
}

impl CacheOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "HIT",
            CacheOutcome::Miss => "MISS",
            CacheOutcome::Bypass => "BYPASS",
            CacheOutcome::Fallback => "FALLBACK",
            CacheOutcome::FallbackCacheHit => "FALLBACK-HIT",
        }
    }
}

impl std::fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A buffered upstream response together with its cache metadata.
///
/// `Bytes` makes clones cheap, so followers of a coalesced flight each get
/// an independently consumable body.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub body: Bytes,
    pub metadata: CacheMetadata,
}

impl CachedResponse {
    #[must_use]
    pub fn into_entry(self) -> KvEntry {
        KvEntry {
            body: self.body,
            metadata: Some(self.metadata),
        }
    }

    #[must_use]
    pub fn from_entry(entry: KvEntry) -> Option<Self> {
        let metadata = entry.metadata?;
        Some(Self {
            status: 200,
            body: entry.body,
            metadata,
        })
    }
}

/// Output of the miss handler, shared between the leader and its followers.
#[derive(Debug, Clone)]
pub struct HandlerResponse {
    pub response: CachedResponse,
    pub outcome: CacheOutcome,
    /// Diagnostic headers (fallback markers, alternative source names).
    pub extra_headers: Vec<(String, String)>,
}

/// The final, possibly range-sliced response handed back to the HTTP layer.
#[derive(Debug)]
pub struct ServedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub outcome: CacheOutcome,
}

impl ServedResponse {
    /// Insert a header, skipping values that do not fit the wire format.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) {
            self.headers.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn metadata(len: u64) -> CacheMetadata {
        CacheMetadata::new(Some("video/mp4".to_string()), len, 86_400, vec![], 1, Utc::now())
    }

    #[test]
    fn test_cached_response_round_trips_through_entry() {
        let resp = CachedResponse {
            status: 200,
            body: Bytes::from_static(b"abcd"),
            metadata: metadata(4),
        };
        let entry = resp.clone().into_entry();
        let back = CachedResponse::from_entry(entry).unwrap();
        assert_eq!(back.body, resp.body);
        assert_eq!(back.metadata.content_length, 4);
    }

    #[test]
    fn test_entry_without_metadata_is_not_a_response() {
        let entry = KvEntry {
            body: Bytes::from_static(b"1"),
            metadata: None,
        };
        assert!(CachedResponse::from_entry(entry).is_none());
    }

    #[test]
    fn test_outcome_strings() {
        assert_eq!(CacheOutcome::Hit.to_string(), "HIT");
        assert_eq!(CacheOutcome::FallbackCacheHit.to_string(), "FALLBACK-HIT");
    }
}
