//! End-to-end pipeline scenarios driven through a recording fetcher
//!
//! Each test builds a `MediaProxy` over a fake upstream, sends one inbound
//! request, then checks both the client response and what was sent upstream.

mod common;

use chrono::{TimeZone, Utc};
use common::{test_config, CannedResponse, RecordingFetcher};
use http_body_util::BodyExt;
use hyper::{Method, StatusCode};
use media_edge_proxy::classifier::ClassificationStrategy;
use media_edge_proxy::orchestrator::{InboundRequest, MediaProxy};
use media_edge_proxy::presigned_url::parse_presigned_url;
use percent_encoding::percent_decode_str;

fn proxy_with(fetcher: RecordingFetcher) -> MediaProxy<RecordingFetcher> {
    MediaProxy::new(&test_config(), fetcher).unwrap()
}

/// Decode the source URL embedded as the last segment of a transform URL
fn embedded_source(transform_url: &str) -> String {
    let encoded = transform_url.rsplit('/').next().unwrap();
    percent_decode_str(encoded).decode_utf8_lossy().into_owned()
}

#[tokio::test]
async fn test_image_with_avif_accept() {
    let fetcher = RecordingFetcher::answering(
        CannedResponse::new(200, b"avif-bytes").with_header("content-type", "image/avif"),
    );
    let proxy = proxy_with(fetcher.clone());

    let response = proxy
        .handle(
            InboundRequest::get("/images/cat.png")
                .with_header("accept", "image/avif,image/webp,image/*,*/*;q=0.8"),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers["x-requested-format"], "avif");
    assert_eq!(headers["x-media-class"], "image");
    assert_eq!(headers["x-origin-signing"], "header");
    assert_eq!(headers["x-media-transform"], "image");
    assert_eq!(headers["x-cache-ttl"], "30");
    assert_eq!(headers["cdn-cache-control"], "max-age=30");
    assert_eq!(headers["content-type"], "image/avif");
    assert!(headers.contains_key("x-request-id"));

    let requests = fetcher.requests();
    assert_eq!(requests.len(), 1);
    let outbound = &requests[0];
    assert_eq!(outbound.method, Method::GET);
    assert!(outbound.url.starts_with(
        "https://transform.example.com/cdn-cgi/image/format=avif,quality=85,origin-auth=share-publicly/"
    ));
    assert_eq!(
        embedded_source(&outbound.url),
        "https://storage.googleapis.com/media-bucket/images/cat.png"
    );
    let authorization = outbound.headers["authorization"].to_str().unwrap();
    assert!(authorization.starts_with("AWS4-HMAC-SHA256 Credential=GOOGTS7C7FUP3AIRVJTE2BCD/"));
    assert!(authorization.contains("/auto/s3/aws4_request"));
    assert_eq!(outbound.headers["x-amz-content-sha256"], "UNSIGNED-PAYLOAD");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"avif-bytes");
}

#[tokio::test]
async fn test_image_with_webp_only_and_without_negotiation() {
    let fetcher = RecordingFetcher::answering(CannedResponse::new(200, b""));
    let proxy = proxy_with(fetcher.clone());

    let response = proxy
        .handle(InboundRequest::get("/a.jpg").with_header("accept", "image/webp,*/*"))
        .await;
    assert_eq!(response.headers()["x-requested-format"], "webp");

    let response = proxy
        .handle(InboundRequest::get("/a.jpg").with_header("accept", "image/png"))
        .await;
    assert_eq!(response.headers()["x-requested-format"], "original");

    let requests = fetcher.requests();
    assert!(requests[0].url.contains("/format=webp,quality=85,"));
    assert!(requests[1].url.contains("/quality=85,origin-auth=share-publicly/"));
    assert!(!requests[1].url.contains("format="));
}

#[tokio::test]
async fn test_mp4_video_goes_through_video_backend_with_presigned_url() {
    let fetcher = RecordingFetcher::answering(
        CannedResponse::new(200, b"mp4").with_header("content-type", "video/mp4"),
    );
    let proxy = proxy_with(fetcher.clone());
    let now = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();

    let response = proxy
        .handle_at(
            InboundRequest::get("/videos/intro.mp4").with_header("accept", "image/avif"),
            now,
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers["x-media-class"], "mp4-video");
    assert_eq!(headers["x-origin-signing"], "query");
    assert_eq!(headers["x-media-transform"], "video");
    assert_eq!(headers["x-cache-ttl"], "86400");
    assert_eq!(headers["x-origin-signature-expires"], "2024-01-16T12:00:00Z");
    assert!(headers.get("x-requested-format").is_none());

    let outbound = &fetcher.requests()[0];
    assert!(outbound.url.starts_with(
        "https://transform.example.com/cdn-cgi/media/mode=video,width=720,fit=contain,format=mp4/"
    ));
    assert!(outbound.headers.get("authorization").is_none());

    let source = embedded_source(&outbound.url);
    assert!(source.starts_with("https://storage.googleapis.com/media-bucket/videos/intro.mp4?"));
    let info = parse_presigned_url(&source).unwrap();
    assert_eq!(info.expires_in_seconds, 86400);
    assert_eq!(info.signed_at, now);
}

#[tokio::test]
async fn test_root_path_is_404_without_fetch() {
    let fetcher = RecordingFetcher::answering(CannedResponse::new(200, b""));
    let proxy = proxy_with(fetcher.clone());

    let response = proxy.handle(InboundRequest::get("/")).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["x-proxy-error"], "EmptyKey");
    assert_eq!(fetcher.request_count(), 0);
}

#[tokio::test]
async fn test_missing_image_passes_404_with_not_found_ttl() {
    let fetcher = RecordingFetcher::answering(CannedResponse::new(404, b"NoSuchKey"));
    let proxy = proxy_with(fetcher.clone());

    let response = proxy.handle(InboundRequest::get("/missing.jpg")).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["x-upstream-status"], "404");
    assert_eq!(response.headers()["x-cache-ttl"], "300");
    assert_eq!(response.headers()["cdn-cache-control"], "max-age=300");
    assert_eq!(fetcher.request_count(), 1);
}

#[tokio::test]
async fn test_server_errors_are_never_cached() {
    let fetcher = RecordingFetcher::answering(CannedResponse::new(503, b"slow down"));
    let proxy = proxy_with(fetcher);

    let response = proxy.handle(InboundRequest::get("/a.png")).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["x-cache-ttl"], "-1");
    assert_eq!(response.headers()["cdn-cache-control"], "no-store");
}

#[tokio::test]
async fn test_missing_credentials_fail_before_fetch() {
    let mut config = test_config();
    config.origin.secret_access_key = None;
    let fetcher = RecordingFetcher::answering(CannedResponse::new(200, b""));
    let proxy = MediaProxy::new(&config, fetcher.clone()).unwrap();

    let response = proxy.handle(InboundRequest::get("/a.png")).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.headers()["x-proxy-error"], "SigningFailure");
    assert_eq!(response.headers()["x-media-class"], "image");
    assert_eq!(fetcher.request_count(), 0);
}

#[tokio::test]
async fn test_connection_failure_is_500() {
    let fetcher = RecordingFetcher::failing();
    let proxy = proxy_with(fetcher.clone());

    let response = proxy.handle(InboundRequest::get("/clip.webm")).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.headers()["x-proxy-error"], "UpstreamFetchFailure");
    assert_eq!(fetcher.request_count(), 1);
}

#[tokio::test]
async fn test_video_backend_failure_passes_status_and_truncated_detail() {
    static LONG_BODY: [u8; 600] = [b'e'; 600];
    let fetcher = RecordingFetcher::answering(CannedResponse::new(502, &LONG_BODY));
    let proxy = proxy_with(fetcher);

    let response = proxy.handle(InboundRequest::get("/videos/broken.mp4")).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        response.headers()["x-proxy-error"],
        "TransformationBackendFailure"
    );
    let detail = response.headers()["x-transform-error"].to_str().unwrap();
    assert_eq!(detail.len(), 256);
    assert_eq!(response.headers()["x-cache-ttl"], "-1");
}

#[tokio::test]
async fn test_other_video_is_fetched_directly_without_transform() {
    let fetcher = RecordingFetcher::answering(CannedResponse::new(206, b"part"));
    let proxy = proxy_with(fetcher.clone());

    let response = proxy
        .handle(InboundRequest::get("/clips/demo.MOV").with_header("range", "bytes=0-3"))
        .await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()["x-media-class"], "other-video");
    assert_eq!(response.headers()["x-media-transform"], "none");
    assert_eq!(response.headers()["x-cache-ttl"], "86400");

    let outbound = &fetcher.requests()[0];
    assert_eq!(
        outbound.url,
        "https://storage.googleapis.com/media-bucket/clips/demo.MOV"
    );
    assert_eq!(outbound.headers["range"], "bytes=0-3");
    assert!(outbound.headers.contains_key("authorization"));
}

#[tokio::test]
async fn test_passthrough_forwards_unchanged() {
    let fetcher = RecordingFetcher::answering(CannedResponse::new(200, b"ok"));
    let proxy = proxy_with(fetcher.clone());

    let mut request = InboundRequest::new(Method::POST, "/cdn-cgi/image/width=100/a.png")
        .with_query("debug=1")
        .with_header("x-forwarded-for", "10.0.0.1");
    request.body = bytes::Bytes::from_static(b"payload");

    let response = proxy.handle(request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-media-class"], "passthrough");
    assert_eq!(response.headers()["cdn-cache-control"], "no-store");
    assert!(response.headers().get("x-origin-signing").is_none());

    let outbound = &fetcher.requests()[0];
    assert_eq!(outbound.method, Method::POST);
    assert_eq!(
        outbound.url,
        "https://transform.example.com/cdn-cgi/image/width=100/a.png?debug=1"
    );
    assert_eq!(outbound.headers["x-forwarded-for"], "10.0.0.1");
    assert_eq!(&outbound.body[..], b"payload");
    assert!(outbound.headers.get("authorization").is_none());
}

#[tokio::test]
async fn test_non_get_media_request_is_rejected() {
    let fetcher = RecordingFetcher::answering(CannedResponse::new(200, b""));
    let proxy = proxy_with(fetcher.clone());

    let response = proxy
        .handle(InboundRequest::new(Method::DELETE, "/a.png"))
        .await;

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(fetcher.request_count(), 0);
}

#[tokio::test]
async fn test_upstream_headers_are_not_replaced() {
    let fetcher = RecordingFetcher::answering(
        CannedResponse::new(200, b"")
            .with_header("cdn-cache-control", "max-age=7")
            .with_header("x-media-class", "from-upstream"),
    );
    let proxy = proxy_with(fetcher);

    let response = proxy.handle(InboundRequest::get("/a.png")).await;

    assert_eq!(response.headers()["cdn-cache-control"], "max-age=7");
    assert_eq!(response.headers()["x-media-class"], "from-upstream");
    assert_eq!(response.headers()["x-cache-ttl"], "30");
}

#[tokio::test]
async fn test_presigned_urls_differ_across_timestamps() {
    let fetcher = RecordingFetcher::answering(CannedResponse::new(200, b""));
    let proxy = proxy_with(fetcher.clone());

    let first = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    let second = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 1).unwrap();
    proxy
        .handle_at(InboundRequest::get("/v.mp4"), first)
        .await;
    proxy
        .handle_at(InboundRequest::get("/v.mp4"), second)
        .await;
    proxy
        .handle_at(InboundRequest::get("/v.mp4"), second)
        .await;

    let requests = fetcher.requests();
    assert_ne!(requests[0].url, requests[1].url);
    assert_eq!(requests[1].url, requests[2].url);
}

#[tokio::test]
async fn test_images_disabled_fetches_origin_directly() {
    let mut config = test_config();
    config.transform.images_enabled = false;
    let fetcher = RecordingFetcher::answering(CannedResponse::new(200, b""));
    let proxy = MediaProxy::new(&config, fetcher.clone()).unwrap();

    let response = proxy
        .handle(InboundRequest::get("/a.png").with_header("accept", "image/avif"))
        .await;

    assert_eq!(response.headers()["x-requested-format"], "original");
    assert_eq!(response.headers()["x-media-transform"], "none");
    assert_eq!(
        fetcher.requests()[0].url,
        "https://storage.googleapis.com/media-bucket/a.png"
    );
}

#[tokio::test]
async fn test_mime_lookup_strategy() {
    let mut config = test_config();
    config.classification = ClassificationStrategy::MimeLookup;
    let fetcher = RecordingFetcher::answering(CannedResponse::new(200, b""));
    let proxy = MediaProxy::new(&config, fetcher.clone()).unwrap();

    let response = proxy.handle(InboundRequest::get("/a.M4V")).await;
    assert_eq!(response.headers()["x-media-class"], "mp4-video");

    let response = proxy.handle(InboundRequest::get("/b.ogv")).await;
    assert_eq!(response.headers()["x-media-class"], "other-video");

    let response = proxy.handle(InboundRequest::get("/c")).await;
    assert_eq!(response.headers()["x-media-class"], "image");
}

#[tokio::test]
async fn test_separate_transform_backend() {
    let mut config = test_config();
    config.transform.backend_base_url = "http://transformer.internal:8088/".to_string();
    let fetcher = RecordingFetcher::answering(CannedResponse::new(200, b""));
    let proxy = MediaProxy::new(&config, fetcher.clone()).unwrap();

    proxy.handle(InboundRequest::get("/v.mp4")).await;

    assert!(fetcher.requests()[0]
        .url
        .starts_with("http://transformer.internal:8088/cdn-cgi/media/"));
}

#[tokio::test]
async fn test_request_returning_through_this_proxy_is_refused() {
    let fetcher = RecordingFetcher::answering(CannedResponse::new(200, b""));
    let proxy = proxy_with(fetcher.clone());

    // What the transformation backend would send back if it were this proxy
    let response = proxy
        .handle(
            InboundRequest::get("/cdn-cgi/image/quality=85,origin-auth=share-publicly/src")
                .with_header("via", "1.1 media-edge-proxy"),
        )
        .await;

    assert_eq!(response.status(), StatusCode::LOOP_DETECTED);
    assert_eq!(response.headers()["x-proxy-error"], "LoopDetected");
    assert_eq!(response.headers()["x-cache-ttl"], "-1");
    assert_eq!(fetcher.request_count(), 0);
}

#[tokio::test]
async fn test_transform_requests_carry_via() {
    let fetcher = RecordingFetcher::answering(CannedResponse::new(200, b""));
    let proxy = proxy_with(fetcher.clone());

    proxy.handle(InboundRequest::get("/a.png")).await;
    proxy.handle(InboundRequest::get("/v.mp4")).await;
    proxy.handle(InboundRequest::get("/c.webm")).await;

    let requests = fetcher.requests();
    assert_eq!(requests[0].headers["via"], "1.1 media-edge-proxy");
    assert_eq!(requests[1].headers["via"], "1.1 media-edge-proxy");
    // Direct origin fetches do not need it
    assert!(requests[2].headers.get("via").is_none());
}

#[tokio::test]
async fn test_head_request_for_media() {
    let fetcher = RecordingFetcher::answering(
        CannedResponse::new(200, b"").with_header("content-length", "4096"),
    );
    let proxy = proxy_with(fetcher.clone());

    let response = proxy
        .handle(InboundRequest::new(Method::HEAD, "/clips/demo.mov"))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-media-class"], "other-video");
    assert_eq!(response.headers()["content-length"], "4096");
    let outbound = &fetcher.requests()[0];
    assert_eq!(outbound.method, Method::HEAD);
    assert!(outbound.headers.contains_key("authorization"));
}
