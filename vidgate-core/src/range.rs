//! Range requests: parse `Range:` headers and slice stored artifacts into
//! 206 partial responses.

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};

use crate::response::{CacheOutcome, ServedResponse};

/// A satisfiable byte range within a body of `total` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ByteRange {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Parse a `Range:` header against a body of `total` bytes.
///
/// Only `bytes=` units and a single range are supported. `a-b` clamps `b`
/// to `total-1`; `a-` runs to the end; `-n` takes the suffix (`-0` is
/// invalid). Returns `None` for anything unsatisfiable.
#[must_use]
pub fn parse_range(header: &str, total: u64) -> Option<ByteRange> {
    if total == 0 {
        return None;
    }
    let spec = header.trim().strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None;
    }

    let (start_raw, end_raw) = spec.split_once('-')?;
    let start_raw = start_raw.trim();
    let end_raw = end_raw.trim();

    if start_raw.is_empty() {
        // Suffix form: last n bytes.
        let n: u64 = end_raw.parse().ok()?;
        if n == 0 {
            return None;
        }
        return Some(ByteRange {
            start: total.saturating_sub(n),
            end: total - 1,
            total,
        });
    }

    let start: u64 = start_raw.parse().ok()?;
    if start >= total {
        return None;
    }
    let end = if end_raw.is_empty() {
        total - 1
    } else {
        let end: u64 = end_raw.parse().ok()?;
        end.min(total - 1)
    };
    if start > end {
        return None;
    }
    Some(ByteRange { start, end, total })
}

/// Headers copied from the full response onto a slice.
const PRESERVED_HEADERS: &[header::HeaderName] = &[
    header::CONTENT_TYPE,
    header::CACHE_CONTROL,
    header::ETAG,
];

/// Produce a 206 partial response from a stored full artifact.
#[must_use]
pub fn slice_response(full: &ServedResponse, range: ByteRange, handler: &str) -> ServedResponse {
    let body = full
        .body
        .slice(range.start as usize..=range.end as usize);

    let mut headers = HeaderMap::new();
    for name in PRESERVED_HEADERS {
        if let Some(value) = full.headers.get(name) {
            headers.insert(name.clone(), value.clone());
        }
    }
    // Diagnostic cache headers travel with the slice.
    for (name, value) in &full.headers {
        if name.as_str().starts_with("x-") {
            headers.insert(name.clone(), value.clone());
        }
    }

    insert(&mut headers, header::CONTENT_RANGE, &format!(
        "bytes {}-{}/{}",
        range.start, range.end, range.total
    ));
    insert(&mut headers, header::CONTENT_LENGTH, &range.len().to_string());
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    insert_name(&mut headers, "x-range-handled-by", handler);

    ServedResponse {
        status: StatusCode::PARTIAL_CONTENT,
        headers,
        body,
        outcome: full.outcome,
    }
}

/// 416 with `Content-Range: bytes */total` for unsatisfiable ranges.
#[must_use]
pub fn unsatisfiable_response(total: u64, outcome: CacheOutcome) -> ServedResponse {
    let mut headers = HeaderMap::new();
    insert(&mut headers, header::CONTENT_RANGE, &format!("bytes */{total}"));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    ServedResponse {
        status: StatusCode::RANGE_NOT_SATISFIABLE,
        headers,
        body: Bytes::new(),
        outcome,
    }
}

fn insert(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::try_from(value) {
        headers.insert(name, value);
    }
}

fn insert_name(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        header::HeaderName::try_from(name),
        HeaderValue::try_from(value),
    ) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_range() {
        assert_eq!(
            parse_range("bytes=0-999", 10_000),
            Some(ByteRange {
                start: 0,
                end: 999,
                total: 10_000
            })
        );
    }

    #[test]
    fn test_single_byte_body() {
        assert_eq!(
            parse_range("bytes=0-0", 1),
            Some(ByteRange {
                start: 0,
                end: 0,
                total: 1
            })
        );
    }

    #[test]
    fn test_round_trip_for_valid_bounds() {
        let total = 5000u64;
        for (a, b) in [(0, 0), (0, 4999), (17, 42), (4999, 4999)] {
            let parsed = parse_range(&format!("bytes={a}-{b}"), total).unwrap();
            assert_eq!((parsed.start, parsed.end, parsed.total), (a, b, total));
        }
    }

    #[test]
    fn test_open_ended_range() {
        assert_eq!(
            parse_range("bytes=100-", 500),
            Some(ByteRange {
                start: 100,
                end: 499,
                total: 500
            })
        );
    }

    #[test]
    fn test_suffix_range() {
        assert_eq!(
            parse_range("bytes=-100", 500),
            Some(ByteRange {
                start: 400,
                end: 499,
                total: 500
            })
        );
        // A suffix longer than the body takes the whole body.
        assert_eq!(
            parse_range("bytes=-900", 500),
            Some(ByteRange {
                start: 0,
                end: 499,
                total: 500
            })
        );
    }

    #[test]
    fn test_invalid_ranges() {
        assert_eq!(parse_range("bytes=-0", 500), None);
        assert_eq!(parse_range("bytes=500-", 500), None);
        assert_eq!(parse_range("bytes=10-5", 500), None);
        assert_eq!(parse_range("bytes=0-10", 0), None);
        assert_eq!(parse_range("items=0-10", 500), None);
        assert_eq!(parse_range("bytes=0-5,10-20", 500), None);
        assert_eq!(parse_range("bytes=abc-def", 500), None);
    }

    #[test]
    fn test_end_is_clamped_to_total() {
        assert_eq!(
            parse_range("bytes=10-9999", 500),
            Some(ByteRange {
                start: 10,
                end: 499,
                total: 500
            })
        );
    }

    fn full_response(len: usize) -> ServedResponse {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
        insert_name(&mut headers, "x-cache", "HIT");
        ServedResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from(vec![7u8; len]),
            outcome: CacheOutcome::Hit,
        }
    }

    #[test]
    fn test_slice_headers_and_body() {
        let full = full_response(10_000);
        let range = parse_range("bytes=0-999", 10_000).unwrap();
        let sliced = slice_response(&full, range, "cache-orchestrator");

        assert_eq!(sliced.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(sliced.body.len(), 1000);
        assert_eq!(
            sliced.headers.get(header::CONTENT_RANGE).unwrap(),
            "bytes 0-999/10000"
        );
        assert_eq!(sliced.headers.get(header::CONTENT_LENGTH).unwrap(), "1000");
        assert_eq!(sliced.headers.get(header::ACCEPT_RANGES).unwrap(), "bytes");
        assert_eq!(
            sliced.headers.get(header::CONTENT_TYPE).unwrap(),
            "video/mp4"
        );
        assert_eq!(sliced.headers.get("x-cache").unwrap(), "HIT");
        assert_eq!(
            sliced.headers.get("x-range-handled-by").unwrap(),
            "cache-orchestrator"
        );
    }

    #[test]
    fn test_unsatisfiable_response_shape() {
        let resp = unsatisfiable_response(10_000, CacheOutcome::Hit);
        assert_eq!(resp.status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            resp.headers.get(header::CONTENT_RANGE).unwrap(),
            "bytes */10000"
        );
        assert!(resp.body.is_empty());
    }
}
