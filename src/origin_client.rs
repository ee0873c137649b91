//! Origin Client Module
//!
//! Network side of the pipeline: sends outbound requests to the object store
//! or the transformation backend over a pooled hyper client and hands the
//! response body back as a stream.

use crate::https_connector::{native_tls_connector, OriginConnector};
use crate::orchestrator::{OutboundRequest, UpstreamFetcher, UpstreamResponse};
use crate::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_LENGTH;
use hyper::{Request, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::{Duration, Instant};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Idle pooled connections are closed after this long
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 32;

/// Pooled HTTP(S) client implementing [`UpstreamFetcher`]
#[derive(Clone)]
pub struct OriginClient {
    client: Client<OriginConnector, Full<Bytes>>,
}

impl OriginClient {
    /// Create a client trusting the platform root certificates
    pub fn new() -> Result<Self> {
        Ok(Self::with_tls_connector(native_tls_connector()?))
    }

    pub fn with_tls_connector(tls_connector: TlsConnector) -> Self {
        debug!(
            "Creating origin client (idle_timeout: {}s, max_idle_per_host: {})",
            POOL_IDLE_TIMEOUT.as_secs(),
            POOL_MAX_IDLE_PER_HOST
        );

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build(OriginConnector::new(tls_connector));

        Self { client }
    }

    fn build_request(request: OutboundRequest) -> Result<Request<Full<Bytes>>> {
        let uri: Uri = request
            .url
            .parse()
            .map_err(|e| ProxyError::HttpError(format!("Invalid upstream URL {}: {}", request.url, e)))?;

        let mut builder = Request::builder().method(request.method).uri(uri);
        for (name, value) in request.headers.iter() {
            // Recomputed by hyper from the body
            if name == CONTENT_LENGTH {
                continue;
            }
            builder = builder.header(name, value);
        }

        builder
            .body(Full::new(request.body))
            .map_err(|e| ProxyError::HttpError(format!("Failed to build request: {}", e)))
    }
}

impl UpstreamFetcher for OriginClient {
    async fn fetch(&self, request: OutboundRequest) -> Result<UpstreamResponse> {
        let start_time = Instant::now();
        let method = request.method.clone();
        let url = request.url.clone();
        let request = Self::build_request(request)?;

        debug!("Sending {} request upstream", method);

        let response = self.client.request(request).await.map_err(|e| {
            ProxyError::UpstreamFetchFailure(format!("{} request failed: {}", method, e))
        })?;

        let (parts, body) = response.into_parts();

        debug!(
            "Received {} from upstream host {} in {}ms (Content-Length: {:?})",
            parts.status,
            url.split('/').nth(2).unwrap_or(""),
            start_time.elapsed().as_millis(),
            parts.headers.get(CONTENT_LENGTH)
        );

        Ok(UpstreamResponse::new(parts.status, parts.headers, body.boxed()))
    }
}
