//! HTTP surface tests: the axum router over an in-memory KV and a stubbed
//! transformation endpoint.
//!
//! Run with: cargo test --test http_tests

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vidgate_core::config::{Config, PathPatternConfig};

async fn test_state(server: &MockServer) -> vidgate::server::AppState {
    let mut config = Config::default();
    config.media.transform_host = server.uri();
    config.media.default_origin = server.uri();
    config.routing.patterns = vec![PathPatternConfig {
        name: "videos".to_string(),
        matcher: "^/videos/(?P<videoId>[^/]+)$".to_string(),
        origin_url_template: Some(format!("{}/origin{}", server.uri(), "${path}")),
        priority: Some(10),
        ..Default::default()
    }];
    vidgate::server::AppState::build(config).await.unwrap()
}

async fn router(server: &MockServer) -> axum::Router {
    vidgate::server::router(test_state(server).await)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

#[tokio::test]
async fn healthz_is_ok() {
    let server = MockServer::start().await;
    let app = router(&server).await;

    let response = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn miss_then_hit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex("^/cdn-cgi/media/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "video/mp4")
                .set_body_bytes(b"transformed video".to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let app = router(&server).await;

    let response = app
        .clone()
        .oneshot(get("/videos/abc.mp4"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-cache").unwrap(), "MISS");
    assert_eq!(body_bytes(response).await, b"transformed video");

    let response = app.oneshot(get("/videos/abc.mp4")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-cache").unwrap(), "HIT");
    assert_eq!(body_bytes(response).await, b"transformed video");
}

#[tokio::test]
async fn unmatched_path_is_404() {
    let server = MockServer::start().await;
    let app = router(&server).await;

    let response = app.oneshot(get("/images/photo.jpg")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_option_is_400_naming_the_parameter() {
    let server = MockServer::start().await;
    let app = router(&server).await;

    let response = app
        .oneshot(get("/videos/abc.mp4?duration=0s"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.contains("duration"));
}

#[tokio::test]
async fn debug_request_bypasses_and_carries_debug_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex("^/cdn-cgi/media/"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
        .mount(&server)
        .await;

    let app = router(&server).await;
    let response = app
        .oneshot(get("/videos/abc.mp4?debug=true"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-cache").unwrap(), "BYPASS");
    assert!(response.headers().contains_key("x-request-id"));
    assert!(response.headers().contains_key("x-processing-time-ms"));
}

#[tokio::test]
async fn range_request_serves_partial_content() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex("^/cdn-cgi/media/"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![8u8; 10_000]))
        .mount(&server)
        .await;

    let app = router(&server).await;

    // Prime the cache.
    let response = app
        .clone()
        .oneshot(get("/videos/y.mp4"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .method("GET")
        .uri("/videos/y.mp4")
        .header("range", "bytes=0-999")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get("content-range").unwrap(),
        "bytes 0-999/10000"
    );
    assert_eq!(response.headers().get("content-length").unwrap(), "1000");
    assert_eq!(body_bytes(response).await.len(), 1000);
}

#[tokio::test]
async fn head_request_keeps_headers_drops_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex("^/cdn-cgi/media/"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"some bytes".to_vec()))
        .mount(&server)
        .await;

    let app = router(&server).await;
    let request = Request::builder()
        .method("HEAD")
        .uri("/videos/h.mp4")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-length").unwrap(), "10");
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn bypass_requests_keep_allowlisted_origin_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex("^/cdn-cgi/media/"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"v".to_vec()))
        .mount(&server)
        .await;

    let mut config = Config::default();
    config.media.transform_host = server.uri();
    // The origin template carries an allow-listed param and a private one.
    config.routing.patterns = vec![PathPatternConfig {
        name: "videos".to_string(),
        matcher: "^/videos/(?P<videoId>[^/]+)$".to_string(),
        origin_url_template: Some(format!(
            "{}/origin{}?debug=view&token=secret",
            server.uri(),
            "${path}"
        )),
        ..Default::default()
    }];
    let app = vidgate::server::router(vidgate::server::AppState::build(config).await.unwrap());

    // Cached path: every origin query parameter is stripped.
    let response = app
        .clone()
        .oneshot(get("/videos/abc.mp4"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Bypassed path: the allow-listed parameter survives, the rest do not.
    let response = app
        .oneshot(get("/videos/abc.mp4?nocache=1"))
        .await
        .unwrap();
    assert_eq!(response.headers().get("x-cache").unwrap(), "BYPASS");

    let requests = server.received_requests().await.unwrap();
    let upstream: Vec<String> = requests
        .iter()
        .filter(|r| r.url.path().starts_with("/cdn-cgi/media/"))
        .map(|r| r.url.to_string())
        .collect();
    assert_eq!(upstream.len(), 2);
    assert!(!upstream[0].contains("debug=view"));
    assert!(!upstream[0].contains("token"));
    assert!(upstream[1].contains("debug=view"));
    assert!(!upstream[1].contains("token"));
}

#[tokio::test]
async fn imquery_width_changes_the_cache_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex("^/cdn-cgi/media/"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"v".to_vec()))
        .expect(2)
        .mount(&server)
        .await;

    let app = router(&server).await;

    // mobile derivative, then tablet: two distinct keys, two fetches.
    let response = app
        .clone()
        .oneshot(get("/videos/k.mp4?imwidth=640"))
        .await
        .unwrap();
    assert_eq!(response.headers().get("x-cache").unwrap(), "MISS");

    let response = app
        .clone()
        .oneshot(get("/videos/k.mp4?imwidth=1280"))
        .await
        .unwrap();
    assert_eq!(response.headers().get("x-cache").unwrap(), "MISS");

    // Same tablet hint again: served from cache.
    let response = app
        .oneshot(get("/videos/k.mp4?imwidth=1280"))
        .await
        .unwrap();
    assert_eq!(response.headers().get("x-cache").unwrap(), "HIT");
}
