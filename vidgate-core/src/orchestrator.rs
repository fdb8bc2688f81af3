//! Cache orchestration: bypass checks, KV lookup, in-flight coalescing,
//! upstream fetch, storage, TTL refresh and range slicing.
//!
//! Coalescing runs over an `async_singleflight::Group` keyed by
//! [`FlightKey`]: the first arrival for a key becomes the leader and runs
//! the upstream handler, later arrivals await its cloned result. The
//! leader's store is awaited inside the flight, so it happens-before any
//! follower returns.

use std::sync::Arc;
use std::time::Duration;

use async_singleflight::Group;
use chrono::Utc;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};

use crate::cachekey::{base_key, versioned_url, VersionManager};
use crate::config::CacheConfig;
use crate::context::RequestContext;
use crate::error::{Error, Result, StorageError};
use crate::fallback::{no_store_headers, FallbackPipeline};
use crate::kv::{CacheMetadata, KvNamespaces};
use crate::range::{parse_range, slice_response, unsatisfiable_response};
use crate::refresh::{refresh_entry, should_refresh, RefreshPolicy};
use crate::response::{CacheOutcome, CachedResponse, HandlerResponse, ServedResponse};
use crate::transform::TransformOptions;
use crate::upstream::{TransformClient, UpstreamResponse};

const RANGE_HANDLER_NAME: &str = "cache-orchestrator";

/// Composite key of the in-flight map. At most one upstream fetch exists
/// per key at any instant; the entry is installed at miss time and removed
/// when the leader completes, success or failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlightKey {
    media_url: String,
    derivative: Option<String>,
    version: u32,
}

/// One resolved origin source: the (signed) origin URL and the transform
/// URL built against it, transform parameters preserved.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub name: String,
    pub origin_url: String,
    pub media_url: String,
}

/// Everything the orchestrator needs for one request. Built by the HTTP
/// surface from the matched pattern, resolved derivative and validated
/// options.
#[derive(Debug, Clone)]
pub struct ServeRequest {
    pub method: Method,
    /// Normalized path, query removed.
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Raw `Range:` header, when the client sent one.
    pub range: Option<String>,
    pub debug: bool,
    /// Matched pattern declared "no rewrite": fetch the origin directly,
    /// never store.
    pub pass_through: bool,
    pub options: TransformOptions,
    pub derivative: Option<String>,
    /// Ordered by ascending priority number; `[0]` is the primary.
    pub sources: Vec<ResolvedSource>,
    pub ttl: Duration,
}

pub struct CacheOrchestrator {
    kv: KvNamespaces,
    versions: VersionManager,
    flights: Group<FlightKey, HandlerResponse, Error>,
    client: Arc<TransformClient>,
    fallback: FallbackPipeline,
    refresh_policy: RefreshPolicy,
    cache_config: CacheConfig,
}

impl CacheOrchestrator {
    #[must_use]
    pub fn new(kv: KvNamespaces, client: Arc<TransformClient>, config: &CacheConfig) -> Self {
        let fallback = FallbackPipeline::new(
            client.clone(),
            kv.fallback.clone(),
            Duration::from_secs(config.default_ttl_seconds),
        );
        Self {
            versions: VersionManager::new(kv.versions.clone()),
            flights: Group::new(),
            fallback,
            refresh_policy: RefreshPolicy::from(config),
            cache_config: config.clone(),
            client,
            kv,
        }
    }

    /// Serve one request through the full state machine.
    pub async fn serve(&self, ctx: &RequestContext, req: &ServeRequest) -> Result<ServedResponse> {
        if self.is_bypass(req) {
            ctx.breadcrumb("orchestrator", "bypassing cache");
            let handled = self.handle_upstream(ctx, req, None).await?;
            // Bypassed responses are returned exactly as handler-produced.
            return Ok(self.finish(req, handled, false));
        }

        if req.sources.is_empty() {
            return Err(Error::config("no origin sources resolved for request"));
        }

        let base = base_key(&req.path, &req.options);
        let version = self.versions.get_current(&base).await;

        // KV lookup; read failures behave as misses.
        match self.kv.artifacts.get(&base).await {
            Ok(Some(entry)) => {
                if let Some(cached) = CachedResponse::from_entry(entry) {
                    ctx.breadcrumb("cache", format!("kv hit: {base}"));
                    self.maybe_refresh(ctx, &base, &cached);
                    let handled = HandlerResponse {
                        response: cached,
                        outcome: CacheOutcome::Hit,
                        extra_headers: Vec::new(),
                    };
                    return Ok(self.finish(req, handled, true));
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(key = %base, error = %err, "kv read failed; treating as miss");
            }
        }

        ctx.breadcrumb("cache", format!("kv miss: {base}"));
        let key = FlightKey {
            media_url: req.sources[0].media_url.clone(),
            derivative: req.derivative.clone(),
            version,
        };

        // Group::work retries with a new leader if the current one is
        // dropped; Err(Some) is the leader's own failure, shared by every
        // follower, and Err(None) means the retries ran out too.
        let handled = match self
            .flights
            .work(&key, self.handle_upstream(ctx, req, Some(&base)))
            .await
        {
            Ok(handled) => handled,
            Err(Some(err)) => return Err(err),
            Err(None) => return Err(Error::Coalescing),
        };

        Ok(self.finish(req, handled, true))
    }

    fn is_bypass(&self, req: &ServeRequest) -> bool {
        if req.pass_through {
            return true;
        }
        if req.method != Method::GET && req.method != Method::HEAD {
            return true;
        }
        req.query
            .iter()
            .any(|(key, _)| self.cache_config.is_bypass_param(key))
    }

    fn maybe_refresh(&self, ctx: &RequestContext, base: &str, cached: &CachedResponse) {
        if !should_refresh(&cached.metadata, Utc::now(), &self.refresh_policy) {
            return;
        }
        ctx.breadcrumb("refresh", format!("refreshing ttl: {base}"));
        let store = self.kv.artifacts.clone();
        let key = base.to_string();
        let body = cached.body.clone();
        let metadata = cached.metadata.clone();
        let policy = self.refresh_policy;
        ctx.detach(Box::pin(refresh_entry(store, key, body, metadata, policy)));
    }

    /// The handler: fetch the transform, route failures through the
    /// fallback pipeline, store successful full responses. `base` is
    /// `None` on the bypass path, which neither versions nor stores.
    async fn handle_upstream(
        &self,
        ctx: &RequestContext,
        req: &ServeRequest,
        base: Option<&str>,
    ) -> Result<HandlerResponse> {
        let primary = req
            .sources
            .first()
            .ok_or_else(|| Error::config("no origin sources resolved for request"))?;

        // The version bump after a miss gives downstream caches a fresh
        // URL for the rebuild.
        let version = match base {
            Some(base) => Some(self.versions.increment(base).await),
            None => None,
        };
        let fetch_url = match version {
            Some(v) => versioned_url(&primary.media_url, v),
            None => primary.media_url.clone(),
        };

        ctx.breadcrumb("upstream", format!("fetching {fetch_url}"));
        match self.client.fetch_transform(&fetch_url).await {
            Ok(resp) if resp.is_success() => {
                self.store_and_wrap(ctx, req, base, version, resp, None).await
            }
            Ok(resp) if resp.status == 404 && req.sources.len() >= 2 => {
                self.retry_alternative(ctx, req, base, version).await
            }
            Ok(resp) => self.classify_failure(ctx, req, base, resp).await,
            Err(Error::Network(reason)) => {
                ctx.breadcrumb("upstream", format!("fetch failed: {reason}"));
                self.serve_fallback(ctx, req, base, "upstream fetch failed", None)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// One retry against the next source by priority, excluding the failed
    /// one, transform parameters preserved.
    async fn retry_alternative(
        &self,
        ctx: &RequestContext,
        req: &ServeRequest,
        base: Option<&str>,
        version: Option<u32>,
    ) -> Result<HandlerResponse> {
        let alternative = &req.sources[1];
        ctx.breadcrumb(
            "fallback",
            format!("404 from {}; retrying source {}", req.sources[0].name, alternative.name),
        );
        let fetch_url = match version {
            Some(v) => versioned_url(&alternative.media_url, v),
            None => alternative.media_url.clone(),
        };
        match self.client.fetch_transform(&fetch_url).await {
            Ok(resp) if resp.is_success() => {
                self.store_and_wrap(ctx, req, base, version, resp, Some(alternative.name.clone()))
                    .await
            }
            Ok(resp) => self.classify_failure(ctx, req, base, resp).await,
            Err(Error::Network(reason)) => {
                ctx.breadcrumb("upstream", format!("alternative fetch failed: {reason}"));
                self.serve_fallback(ctx, req, base, "upstream fetch failed", None)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// Transform endpoint non-2xx: 5xx goes to fallback, anything else is
    /// surfaced to the client and never stored.
    async fn classify_failure(
        &self,
        ctx: &RequestContext,
        req: &ServeRequest,
        base: Option<&str>,
        resp: UpstreamResponse,
    ) -> Result<HandlerResponse> {
        if resp.status >= 500 {
            ctx.breadcrumb("upstream", format!("transform returned {}", resp.status));
            return self
                .serve_fallback(ctx, req, base, "transform server error", Some(resp.status))
                .await;
        }

        ctx.breadcrumb("upstream", format!("surfacing client error {}", resp.status));
        let metadata = CacheMetadata::new(
            resp.content_type(),
            resp.body.len() as u64,
            0,
            Vec::new(),
            0,
            Utc::now(),
        );
        Ok(HandlerResponse {
            response: CachedResponse {
                status: resp.status,
                body: resp.body,
                metadata,
            },
            outcome: CacheOutcome::Miss,
            extra_headers: vec![(
                "x-original-status".to_string(),
                resp.status.to_string(),
            )],
        })
    }

    async fn serve_fallback(
        &self,
        ctx: &RequestContext,
        req: &ServeRequest,
        base: Option<&str>,
        reason: &str,
        original_status: Option<u16>,
    ) -> Result<HandlerResponse> {
        let primary = &req.sources[0];
        let owned_base;
        let base = match base {
            Some(base) => base,
            None => {
                owned_base = base_key(&req.path, &req.options);
                &owned_base
            }
        };
        self.fallback
            .serve_original(ctx, base, &req.path, &primary.origin_url, reason, original_status)
            .await
    }

    /// Wrap a successful upstream response, storing 200 full responses
    /// under the base key. Oversized bodies are served uncached through
    /// the fallback decoration; other store failures drop the entry.
    async fn store_and_wrap(
        &self,
        ctx: &RequestContext,
        req: &ServeRequest,
        base: Option<&str>,
        version: Option<u32>,
        resp: UpstreamResponse,
        fallback_source: Option<String>,
    ) -> Result<HandlerResponse> {
        let mut cache_tags = vec!["video".to_string(), format!("source:{}", req.path)];
        if let Some(derivative) = &req.derivative {
            cache_tags.push(format!("derivative:{derivative}"));
        }
        let mut metadata = CacheMetadata::new(
            resp.content_type(),
            resp.body.len() as u64,
            req.ttl.as_secs(),
            cache_tags,
            version.unwrap_or(0),
            Utc::now(),
        );
        metadata.etag = resp
            .headers
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let cached = CachedResponse {
            status: resp.status,
            body: resp.body,
            metadata,
        };
        let mut extra_headers = Vec::new();
        if let Some(name) = fallback_source {
            extra_headers.push(("x-fallback-source".to_string(), name));
        }

        if let Some(base) = base {
            if cached.status == 200 {
                let put = self
                    .kv
                    .artifacts
                    .put(
                        base,
                        cached.body.clone(),
                        Some(cached.metadata.clone()),
                        Some(req.ttl),
                    )
                    .await;
                match put {
                    Ok(()) => ctx.breadcrumb("cache", format!("stored {base}")),
                    Err(StorageError::ValueTooLarge { size, limit }) => {
                        tracing::warn!(
                            key = %base,
                            size,
                            limit,
                            "response exceeds cache size limit; serving uncached"
                        );
                        extra_headers
                            .extend(no_store_headers("response exceeds cache size limit", None));
                        return Ok(HandlerResponse {
                            response: cached,
                            outcome: CacheOutcome::Fallback,
                            extra_headers,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(key = %base, error = %err, "kv store failed; entry dropped");
                    }
                }
            }
        }

        Ok(HandlerResponse {
            response: cached,
            outcome: if base.is_some() {
                CacheOutcome::Miss
            } else {
                CacheOutcome::Bypass
            },
            extra_headers,
        })
    }

    /// Assemble the final response: delivery headers, `X-Cache`, debug
    /// cache tags, then range slicing when the client asked for one.
    fn finish(&self, req: &ServeRequest, handled: HandlerResponse, allow_range: bool) -> ServedResponse {
        let HandlerResponse {
            response,
            outcome,
            extra_headers,
        } = handled;

        let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
        let mut headers = HeaderMap::new();
        if let Some(content_type) = &response.metadata.content_type {
            set_header(&mut headers, "content-type", content_type);
        }
        set_header(
            &mut headers,
            "content-length",
            &response.body.len().to_string(),
        );
        if status == StatusCode::OK {
            headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        }
        if let Some(etag) = &response.metadata.etag {
            set_header(&mut headers, "etag", etag);
        }
        set_header(&mut headers, "x-cache", outcome.as_str());
        if req.debug && !response.metadata.cache_tags.is_empty() {
            set_header(
                &mut headers,
                "x-cache-tags",
                &response.metadata.cache_tags.join(","),
            );
        }
        for (name, value) in &extra_headers {
            set_header(&mut headers, name, value);
        }

        let mut served = ServedResponse {
            status,
            headers,
            body: response.body,
            outcome,
        };

        if allow_range && served.status == StatusCode::OK {
            if let Some(range_header) = &req.range {
                let total = served.body.len() as u64;
                served = match parse_range(range_header, total) {
                    Some(range) => slice_response(&served, range, RANGE_HANDLER_NAME),
                    None => {
                        let mut resp = unsatisfiable_response(total, outcome);
                        resp.set_header("x-cache", outcome.as_str());
                        resp
                    }
                };
            }
        }

        served
    }
}

fn set_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        header::HeaderName::try_from(name),
        HeaderValue::try_from(value),
    ) {
        headers.insert(name, value);
    }
}
