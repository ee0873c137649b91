//! HTTP Proxy Module
//!
//! hyper 1 server shell around [`MediaProxy`]: accepts connections, limits
//! concurrent requests, converts between hyper types and the pipeline's
//! request/response types, and drains in-flight work on shutdown.
//!
//! Media requests never carry a meaningful body, so theirs is dropped unread.
//! Passthrough bodies are collected up to a configured limit; anything larger
//! is refused with 413.

use crate::orchestrator::{full_body, InboundRequest, MediaProxy, ProxyBody, UpstreamFetcher};
use crate::shutdown::ShutdownSignal;
use crate::Result;
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// HTTP proxy server
pub struct HttpProxy<F: UpstreamFetcher> {
    listen_addr: SocketAddr,
    proxy: Arc<MediaProxy<F>>,
    request_semaphore: Arc<Semaphore>,
    active_connections: Arc<AtomicUsize>,
    active_requests: Arc<AtomicUsize>,
    max_body_bytes: usize,
}

/// Default cap on a collected passthrough body
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Why a request body was not accepted
#[derive(Debug)]
pub enum BodyRejection {
    TooLarge,
    Unreadable(String),
}

/// Decrements a counter when dropped
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl<F: UpstreamFetcher> HttpProxy<F> {
    pub fn new(listen_addr: SocketAddr, proxy: Arc<MediaProxy<F>>, max_concurrent_requests: usize) -> Self {
        Self {
            listen_addr,
            proxy,
            request_semaphore: Arc::new(Semaphore::new(max_concurrent_requests)),
            active_connections: Arc::new(AtomicUsize::new(0)),
            active_requests: Arc::new(AtomicUsize::new(0)),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Cap passthrough request bodies at `max_body_bytes`
    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Counter of requests currently being handled
    pub fn active_requests(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active_requests)
    }

    /// Bind the configured address and serve until shutdown
    pub async fn start(&self, shutdown_signal: ShutdownSignal) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!("HTTP proxy listening on {}", self.listen_addr);
        self.serve(listener, shutdown_signal).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener, mut shutdown_signal: ShutdownSignal) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("HTTP connection from {}", addr);

                            // Set TCP_NODELAY to disable Nagle's algorithm for lower latency
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }

                            let proxy = Arc::clone(&self.proxy);
                            let request_semaphore = Arc::clone(&self.request_semaphore);
                            let active_connections = Arc::clone(&self.active_connections);
                            let active_requests = Arc::clone(&self.active_requests);
                            let max_body_bytes = self.max_body_bytes;

                            tokio::spawn(async move {
                                Self::serve_connection(
                                    stream,
                                    addr,
                                    proxy,
                                    request_semaphore,
                                    active_connections,
                                    active_requests,
                                    max_body_bytes,
                                )
                                .await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept HTTP connection: {}", e);
                        }
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("HTTP proxy received shutdown signal, stopping accept loop");
                    break;
                }
            }
        }

        // Drain period: wait for in-flight connections to complete
        let drain_timeout = Duration::from_secs(5);
        let drain_start = std::time::Instant::now();
        let active = self.active_connections.load(Ordering::Relaxed);
        if active > 0 {
            info!("HTTP proxy draining {} active connections (timeout: {:?})", active, drain_timeout);
            while self.active_connections.load(Ordering::Relaxed) > 0
                && drain_start.elapsed() < drain_timeout
            {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            let remaining = self.active_connections.load(Ordering::Relaxed);
            if remaining > 0 {
                warn!("HTTP proxy shutdown with {} connections still active", remaining);
            } else {
                info!("HTTP proxy all connections drained");
            }
        }

        info!("HTTP proxy stopped");
        Ok(())
    }

    /// Serve a single HTTP connection
    async fn serve_connection(
        stream: TcpStream,
        addr: SocketAddr,
        proxy: Arc<MediaProxy<F>>,
        request_semaphore: Arc<Semaphore>,
        active_connections: Arc<AtomicUsize>,
        active_requests: Arc<AtomicUsize>,
        max_body_bytes: usize,
    ) {
        let io = TokioIo::new(stream);
        let _connection = InFlightGuard::new(&active_connections);

        let service = service_fn(move |req| {
            let proxy = Arc::clone(&proxy);
            let request_semaphore = Arc::clone(&request_semaphore);
            let active_requests = Arc::clone(&active_requests);
            async move {
                Self::handle_request(req, proxy, request_semaphore, active_requests, max_body_bytes)
                    .await
            }
        });

        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            let err_str = err.to_string();
            if err_str.contains("connection closed")
                || err_str.contains("broken pipe")
                || err_str.contains("reset by peer")
                || err.is_canceled()
            {
                debug!("Client disconnected from {}: {}", addr, err);
            } else {
                error!("Error serving HTTP connection from {}: {}", addr, err);
            }
        }
    }

    /// Handle a single HTTP request
    pub async fn handle_request(
        req: Request<hyper::body::Incoming>,
        proxy: Arc<MediaProxy<F>>,
        request_semaphore: Arc<Semaphore>,
        active_requests: Arc<AtomicUsize>,
        max_body_bytes: usize,
    ) -> std::result::Result<Response<ProxyBody>, Infallible> {
        let _permit = match request_semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Request limit exceeded, returning 429");
                return Ok(Self::build_error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "TooManyRequests",
                    Some("10"),
                ));
            }
        };
        let _in_flight = InFlightGuard::new(&active_requests);

        let (parts, body) = req.into_parts();
        let body = if proxy.is_passthrough(parts.uri.path()) {
            match read_limited_body(&parts.headers, body, max_body_bytes).await {
                Ok(bytes) => bytes,
                Err(BodyRejection::TooLarge) => {
                    warn!(
                        "Request body for {} exceeds {} bytes, returning 413",
                        parts.uri.path(),
                        max_body_bytes
                    );
                    return Ok(Self::build_error_response(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        "PayloadTooLarge",
                        None,
                    ));
                }
                Err(BodyRejection::Unreadable(e)) => {
                    warn!("Failed to read request body for {}: {}", parts.uri.path(), e);
                    return Ok(Self::build_error_response(
                        StatusCode::BAD_REQUEST,
                        "InvalidRequestBody",
                        None,
                    ));
                }
            }
        } else {
            drop(body);
            Bytes::new()
        };

        let inbound = InboundRequest {
            method: parts.method,
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(|q| q.to_string()),
            headers: parts.headers,
            body,
        };

        Ok(proxy.handle(inbound).await)
    }

    fn build_error_response(
        status: StatusCode,
        code: &'static str,
        retry_after: Option<&'static str>,
    ) -> Response<ProxyBody> {
        let mut response = Response::new(full_body(Bytes::from(format!("{}\n", code))));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        headers.insert("x-proxy-error", HeaderValue::from_static(code));
        if let Some(retry_after) = retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from_static(retry_after));
        }
        response
    }
}

/// Collect a request body of at most `limit` bytes
///
/// A declared `Content-Length` above the limit is refused before any byte is
/// read; otherwise collection stops as soon as the limit is crossed.
pub async fn read_limited_body<B>(
    headers: &HeaderMap,
    body: B,
    limit: usize,
) -> std::result::Result<Bytes, BodyRejection>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        return Err(BodyRejection::TooLarge);
    }

    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(BodyRejection::TooLarge),
        Err(e) => Err(BodyRejection::Unreadable(e.to_string())),
    }
}
