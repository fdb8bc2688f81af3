//! The video delivery handler: route, resolve, validate, orchestrate.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use vidgate_core::context::TokioDetacher;
use vidgate_core::derivative::ClientHints;
use vidgate_core::logging::generate_request_id;
use vidgate_core::orchestrator::{ResolvedSource, ServeRequest};
use vidgate_core::routing::{
    extract_video_id, normalize_path, substitute_template, PathPattern,
};
use vidgate_core::signer::sign_if_required;
use vidgate_core::transform::{build_media_url, TransformOptions, UrlMode};
use vidgate_core::RequestContext;

use crate::http::error::{AppError, AppResult};
use crate::server::AppState;

/// Catch-all handler for video paths.
pub async fn handle(State(state): State<AppState>, request: Request) -> Response {
    let ctx = RequestContext::new(
        generate_request_id(),
        Some(Arc::new(TokioDetacher)),
        state.background.clone(),
    );

    let result = serve(&state, &ctx, request).await;
    ctx.flush();
    match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve(state: &AppState, ctx: &RequestContext, request: Request) -> AppResult<Response> {
    let (parts, _) = request.into_parts();
    let method = parts.method.clone();
    let path = normalize_path(parts.uri.path());
    let query = parse_query(parts.uri.query().unwrap_or(""));
    let debug_requested = query
        .iter()
        .any(|(k, v)| k == "debug" && v == "true");

    let Some((pattern, captures)) = state.ruleset.match_with_captures(&path) else {
        debug!(%path, "no pattern matched");
        return Err(AppError::not_found(format!("no route for {path}")));
    };
    ctx.breadcrumb(
        "router",
        match extract_video_id(&captures) {
            Some(id) => format!("matched pattern {} (video {id})", pattern.name),
            None => format!("matched pattern {}", pattern.name),
        },
    );

    // Sizing hints -> derivative.
    let hints = ClientHints::from_request(&parts.headers, &query);
    let resolution = state.resolver.resolve(&hints);
    ctx.breadcrumb(
        "derivative",
        match resolution.derivative_name() {
            Some(name) => format!("resolved derivative {name}"),
            None => "explicit dimensions".to_string(),
        },
    );

    // Option validation surfaces 400s naming the parameter.
    let mut options = TransformOptions::from_query(&query)?;
    options.apply_resolution(&resolution);
    options.validate(&state.limits)?;

    // Bypassed requests are handler-produced and never stored, so the
    // allow-listed origin query parameters may survive on them. Cached
    // requests strip all origin queries to keep keys stable.
    let url_mode = if query
        .iter()
        .any(|(key, _)| state.config.cache.is_bypass_param(key))
    {
        UrlMode::Async
    } else {
        UrlMode::Sync
    };

    let sources = resolve_sources(state, ctx, &pattern, &captures, &path, &options, url_mode)?;

    let ttl = pattern
        .ttl
        .as_ref()
        .map(|t| Duration::from_secs(t.ok_seconds))
        .unwrap_or(Duration::from_secs(state.config.cache.default_ttl_seconds));

    let serve_request = ServeRequest {
        method: method.clone(),
        path,
        query,
        range: parts
            .headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        debug: debug_requested,
        pass_through: pattern.is_pass_through(),
        derivative: resolution.derivative_name().map(str::to_string),
        options,
        sources,
        ttl,
    };

    let served = state.orchestrator.serve(ctx, &serve_request).await?;

    let mut response = http::Response::builder().status(served.status);
    if let Some(headers) = response.headers_mut() {
        headers.extend(served.headers);
        if debug_requested {
            insert(headers, "x-request-id", &ctx.id);
            insert(headers, "x-processing-time-ms", &ctx.elapsed_ms().to_string());
        }
    }

    // HEAD keeps the entity headers, drops the body.
    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(served.body)
    };
    response
        .body(body)
        .map_err(|e| AppError::internal_server_error(format!("failed to build response: {e}")))
}

/// Resolve every origin source of the pattern: substitute captures into
/// the URL template, sign when an auth descriptor is present, and build
/// the transform URL against it.
fn resolve_sources(
    state: &AppState,
    ctx: &RequestContext,
    pattern: &PathPattern,
    captures: &vidgate_core::routing::PathCaptures,
    path: &str,
    options: &TransformOptions,
    url_mode: UrlMode,
) -> AppResult<Vec<ResolvedSource>> {
    if pattern.is_pass_through() {
        let origin = format!(
            "{}{}",
            state.config.media.default_origin.trim_end_matches('/'),
            path
        );
        return Ok(vec![ResolvedSource {
            name: "pass-through".to_string(),
            media_url: origin.clone(),
            origin_url: origin,
        }]);
    }

    let mut sources = Vec::with_capacity(pattern.sources.len());
    for source in &pattern.sources {
        let origin = substitute_template(&source.url_template, captures, path);
        let auth = source.auth.as_ref().or(pattern.auth.as_ref());
        let origin = sign_if_required(state.signer.as_ref(), &origin, auth)?;
        let media_url = build_media_url(
            &state.config.media.transform_host,
            options,
            &origin,
            url_mode,
            &state.config.media.async_query_allowlist,
        );
        sources.push(ResolvedSource {
            name: source.name.clone(),
            origin_url: origin,
            media_url,
        });
    }
    ctx.breadcrumb("router", format!("resolved {} source(s)", sources.len()));
    Ok(sources)
}

fn parse_query(raw: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn insert(headers: &mut http::HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        http::header::HeaderName::try_from(name),
        HeaderValue::try_from(value),
    ) {
        headers.insert(name, value);
    }
}
