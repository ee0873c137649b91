//! HTTP server tests over real TCP connections

mod common;

use bytes::Bytes;
use common::{test_config, CannedResponse, RecordingFetcher};
use http_body_util::{BodyExt, Empty, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use media_edge_proxy::http_proxy::HttpProxy;
use media_edge_proxy::orchestrator::MediaProxy;
use media_edge_proxy::origin_client::OriginClient;
use media_edge_proxy::shutdown::{ShutdownCoordinator, ShutdownSignal};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

struct RunningProxy {
    addr: SocketAddr,
    coordinator: ShutdownCoordinator,
    task: JoinHandle<()>,
}

async fn start_proxy(fetcher: RecordingFetcher, max_concurrent_requests: usize) -> RunningProxy {
    start_proxy_with_body_limit(fetcher, max_concurrent_requests, 1024 * 1024).await
}

async fn start_proxy_with_body_limit(
    fetcher: RecordingFetcher,
    max_concurrent_requests: usize,
    max_body_bytes: usize,
) -> RunningProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let media_proxy = Arc::new(MediaProxy::new(&test_config(), fetcher).unwrap());
    let http_proxy = HttpProxy::new(addr, media_proxy, max_concurrent_requests)
        .with_max_body_bytes(max_body_bytes);

    let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(2));
    coordinator.set_active_requests(http_proxy.active_requests());
    let signal = ShutdownSignal::new(coordinator.subscribe());

    let task = tokio::spawn(async move {
        http_proxy.serve(listener, signal).await.unwrap();
    });

    RunningProxy {
        addr,
        coordinator,
        task,
    }
}

fn client() -> Client<hyper_util::client::legacy::connect::HttpConnector, Empty<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

fn body_client() -> Client<hyper_util::client::legacy::connect::HttpConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

#[tokio::test]
async fn test_serves_media_over_http() {
    let fetcher = RecordingFetcher::answering(
        CannedResponse::new(200, b"webp-bytes").with_header("content-type", "image/webp"),
    );
    let running = start_proxy(fetcher.clone(), 16).await;

    let request = Request::get(format!("http://{}/gallery/sunset.jpg?v=2", running.addr))
        .header("accept", "image/webp,*/*")
        .body(Empty::new())
        .unwrap();
    let response = client().request(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-media-class"], "image");
    assert_eq!(response.headers()["x-requested-format"], "webp");
    assert_eq!(response.headers()["content-type"], "image/webp");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"webp-bytes");

    let requests = fetcher.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].url.contains("/cdn-cgi/image/format=webp,"));
    // The query string is not part of the object key
    assert!(!requests[0].url.contains("v%3D2"));

    running.coordinator.initiate_shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), running.task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_rejects_when_request_limit_exhausted() {
    let fetcher = RecordingFetcher::answering(CannedResponse::new(200, b""));
    let running = start_proxy(fetcher.clone(), 0).await;

    let request = Request::get(format!("http://{}/a.png", running.addr))
        .body(Empty::new())
        .unwrap();
    let response = client().request(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "10");
    assert_eq!(response.headers()["x-proxy-error"], "TooManyRequests");
    assert_eq!(fetcher.request_count(), 0);

    running.coordinator.initiate_shutdown().await.unwrap();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_root_request_over_http_is_404() {
    let fetcher = RecordingFetcher::answering(CannedResponse::new(200, b""));
    let running = start_proxy(fetcher.clone(), 4).await;

    let request = Request::get(format!("http://{}/", running.addr))
        .body(Empty::new())
        .unwrap();
    let response = client().request(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["x-cache-ttl"], "-1");
    assert_eq!(fetcher.request_count(), 0);

    running.coordinator.initiate_shutdown().await.unwrap();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_active_requests_return_to_zero() {
    let fetcher = RecordingFetcher::answering(CannedResponse::new(200, b"ok"));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let media_proxy = Arc::new(MediaProxy::new(&test_config(), fetcher).unwrap());
    let http_proxy = HttpProxy::new(addr, media_proxy, 8);
    let active_requests = http_proxy.active_requests();

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(2));
    let signal = ShutdownSignal::new(coordinator.subscribe());
    let task = tokio::spawn(async move { http_proxy.serve(listener, signal).await });

    for path in ["/a.png", "/b.mp4", "/c.webm"] {
        let request = Request::get(format!("http://{}{}", addr, path))
            .body(Empty::new())
            .unwrap();
        let response = client().request(request).await.unwrap();
        response.into_body().collect().await.unwrap();
    }

    assert_eq!(active_requests.load(Ordering::Relaxed), 0);

    coordinator.initiate_shutdown().await.unwrap();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_oversized_passthrough_body_is_refused() {
    let fetcher = RecordingFetcher::answering(CannedResponse::new(200, b"ok"));
    let running = start_proxy_with_body_limit(fetcher.clone(), 4, 16).await;

    let request = Request::post(format!("http://{}/cdn-cgi/upload", running.addr))
        .body(Full::new(Bytes::from(vec![b'x'; 1024])))
        .unwrap();
    let response = body_client().request(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(response.headers()["x-proxy-error"], "PayloadTooLarge");
    assert_eq!(fetcher.request_count(), 0);

    // Within the limit the same path is forwarded with its body
    let request = Request::post(format!("http://{}/cdn-cgi/upload", running.addr))
        .body(Full::new(Bytes::from_static(b"small")))
        .unwrap();
    let response = body_client().request(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let requests = fetcher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(&requests[0].body[..], b"small");

    running.coordinator.initiate_shutdown().await.unwrap();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_media_request_body_is_ignored() {
    let fetcher = RecordingFetcher::answering(CannedResponse::new(200, b"png"));
    let running = start_proxy_with_body_limit(fetcher.clone(), 4, 16).await;

    let request = Request::get(format!("http://{}/a.png", running.addr))
        .body(Full::new(Bytes::from(vec![b'x'; 1024])))
        .unwrap();
    let response = body_client().request(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let requests = fetcher.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].body.is_empty());

    running.coordinator.initiate_shutdown().await.unwrap();
    running.task.await.unwrap();
}

#[tokio::test]
async fn test_head_request_over_http() {
    let fetcher = RecordingFetcher::answering(
        CannedResponse::new(200, b"").with_header("content-type", "video/webm"),
    );
    let running = start_proxy(fetcher.clone(), 4).await;

    let request = Request::builder()
        .method(Method::HEAD)
        .uri(format!("http://{}/clips/a.webm", running.addr))
        .body(Empty::new())
        .unwrap();
    let response = client().request(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-media-class"], "other-video");
    assert_eq!(fetcher.requests()[0].method, Method::HEAD);

    running.coordinator.initiate_shutdown().await.unwrap();
    running.task.await.unwrap();
}

/// Points the transformation backend at the proxy's own listener
#[tokio::test]
async fn test_backend_pointing_back_at_proxy_stops_after_one_hop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut config = test_config();
    config.server.public_base_url = format!("http://{}", addr);
    config.transform.backend_base_url = format!("http://{}", addr);
    assert!(config.validate().is_err());

    let _ = rustls::crypto::ring::default_provider().install_default();
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    let origin = OriginClient::with_tls_connector(TlsConnector::from(Arc::new(tls_config)));

    let media_proxy = Arc::new(MediaProxy::new(&config, origin).unwrap());
    let http_proxy = HttpProxy::new(addr, media_proxy, 4);
    let active_requests = http_proxy.active_requests();
    let coordinator = ShutdownCoordinator::new(Duration::from_secs(2));
    let signal = ShutdownSignal::new(coordinator.subscribe());
    let task = tokio::spawn(async move { http_proxy.serve(listener, signal).await });

    let request = Request::get(format!("http://{}/images/cat.png", addr))
        .header("accept", "image/avif")
        .body(Empty::new())
        .unwrap();
    let response = tokio::time::timeout(Duration::from_secs(10), client().request(request))
        .await
        .unwrap()
        .unwrap();

    // The second hop refuses and the image path passes its status through
    assert_eq!(response.status(), StatusCode::LOOP_DETECTED);
    assert_eq!(response.headers()["x-upstream-status"], "508");
    response.into_body().collect().await.unwrap();
    assert_eq!(active_requests.load(Ordering::Relaxed), 0);

    coordinator.initiate_shutdown().await.unwrap();
    assert!(task.await.unwrap().is_ok());
}
