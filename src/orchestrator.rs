//! Proxy Orchestrator Module
//!
//! Runs the per-request pipeline: extract the object key, classify it, sign the
//! origin request, select a transformation, fetch through an
//! [`UpstreamFetcher`], then annotate the result with cache and diagnostic
//! headers. Every outcome, including failures, becomes a complete response.
//!
//! ```text
//! Start -> KeyExtracted -> Classified -> TransformSelected -> Signed -> Fetched -> Annotated -> Done
//!   |                                                                                 ^
//!   +--(passthrough prefix)--------------------------------------------> Fetched -----+
//! ```

use crate::annotator::{Decisions, ResponseAnnotator};
use crate::cache_policy::CachePolicyMapper;
use crate::classifier::{ContentClassifier, MediaClass};
use crate::config::Config;
use crate::logging::{AccessRecord, LoggerManager};
use crate::object_key::ObjectKey;
use crate::origin_signer::{OriginSigner, SignedOriginRequest, SigningMode};
use crate::presigned_url::parse_presigned_url;
use crate::transform::{build_transform_url, TransformationDirective, TransformationPolicySelector};
use crate::{ProxyError, Result};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, HOST, VIA};
use hyper::{Method, Response, StatusCode};
use std::fmt;
use std::future::Future;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Body type shared by upstream and client responses
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Inbound request headers forwarded with media fetches
const FORWARDED_MEDIA_HEADERS: &[&str] = &[
    "range",
    "if-range",
    "if-none-match",
    "if-modified-since",
];

/// Pseudonym this proxy records in `Via` on requests to the transformation backend
pub const VIA_PSEUDONYM: &str = "media-edge-proxy";
const VIA_VALUE: &str = "1.1 media-edge-proxy";

/// Hop-by-hop headers never forwarded on passthrough
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A client request, detached from the server framework
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InboundRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Add a header; invalid names or values are ignored
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn accept(&self) -> Option<&str> {
        self.headers.get(ACCEPT).and_then(|v| v.to_str().ok())
    }

    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) if !query.is_empty() => format!("{}?{}", self.path, query),
            _ => self.path.clone(),
        }
    }
}

/// A request the proxy sends upstream
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Status, headers and a streaming body received from upstream
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ProxyBody,
}

impl UpstreamResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ProxyBody) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn full(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self::new(status, HeaderMap::new(), full_body(body.into()))
    }
}

impl fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Performs the network side of the pipeline
///
/// Implementations report connection-level failures as errors; any HTTP status,
/// including 4xx and 5xx, is a successful fetch.
pub trait UpstreamFetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        request: OutboundRequest,
    ) -> impl Future<Output = Result<UpstreamResponse>> + Send;
}

/// Pipeline checkpoints reported through tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Start,
    KeyExtracted,
    Classified,
    TransformSelected,
    Signed,
    Fetched,
    Annotated,
    Done,
    Error,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Start => "start",
            PipelineStage::KeyExtracted => "key_extracted",
            PipelineStage::Classified => "classified",
            PipelineStage::TransformSelected => "transform_selected",
            PipelineStage::Signed => "signed",
            PipelineStage::Fetched => "fetched",
            PipelineStage::Annotated => "annotated",
            PipelineStage::Done => "done",
            PipelineStage::Error => "error",
        }
    }
}

fn checkpoint(request_id: &str, stage: PipelineStage, detail: &str) {
    debug!(
        target: "media_edge_proxy::pipeline",
        request_id = %request_id,
        stage = stage.as_str(),
        "{}",
        detail
    );
}

/// Everything decided before the upstream fetch
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub class: MediaClass,
    pub key: Option<ObjectKey>,
    pub signed: Option<SignedOriginRequest>,
    pub directive: TransformationDirective,
    pub outbound: OutboundRequest,
}

/// Media edge proxy pipeline
///
/// All components are immutable after construction; one instance is shared
/// read-only by every request task.
pub struct MediaProxy<F: UpstreamFetcher> {
    classifier: ContentClassifier,
    signer: OriginSigner,
    selector: TransformationPolicySelector,
    cache_policy: CachePolicyMapper,
    annotator: ResponseAnnotator,
    fetcher: F,
    bucket: String,
    transform_base_url: String,
    image_prefix: String,
    video_prefix: String,
    images_enabled: bool,
    error_detail_limit: usize,
    access_log_enabled: bool,
}

impl<F: UpstreamFetcher> MediaProxy<F> {
    pub fn new(config: &Config, fetcher: F) -> Result<Self> {
        let signer = OriginSigner::from_config(&config.origin)?;
        if !signer.has_credentials() {
            warn!("Origin signer has no credentials; media requests will fail with SigningFailure");
        }

        Ok(Self {
            classifier: ContentClassifier::new(
                config.classification,
                config.transform.passthrough_prefix.clone(),
            ),
            signer,
            selector: TransformationPolicySelector::new(&config.transform),
            cache_policy: CachePolicyMapper::new(config.cache.image, config.cache.video),
            annotator: ResponseAnnotator::new(),
            fetcher,
            bucket: config.origin.bucket.clone(),
            transform_base_url: config.transform_base_url().trim_end_matches('/').to_string(),
            image_prefix: config.transform.image_prefix.clone(),
            video_prefix: config.transform.video_prefix.clone(),
            images_enabled: config.transform.images_enabled,
            error_detail_limit: config.transform.error_detail_limit,
            access_log_enabled: config.logging.access_log_enabled,
        })
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Whether `path` is forwarded unchanged to the transformation backend
    pub fn is_passthrough(&self, path: &str) -> bool {
        self.classifier.is_passthrough(path)
    }

    /// Handle one request; never fails, errors become responses
    pub async fn handle(&self, request: InboundRequest) -> Response<ProxyBody> {
        self.handle_at(request, Utc::now()).await
    }

    /// Handle one request signing at `now`
    pub async fn handle_at(&self, request: InboundRequest, now: DateTime<Utc>) -> Response<ProxyBody> {
        let started = Instant::now();
        let mut decisions = Decisions::new(Uuid::new_v4().to_string());
        let method = request.method.clone();
        let path = request.path.clone();

        checkpoint(
            &decisions.request_id,
            PipelineStage::Start,
            &format!("{} {}", method, path),
        );

        let response = match self.run(request, now, &mut decisions).await {
            Ok(response) => {
                checkpoint(&decisions.request_id, PipelineStage::Done, "response ready");
                response
            }
            Err(error) => {
                checkpoint(&decisions.request_id, PipelineStage::Error, &error.to_string());
                if error.is_pre_fetch() {
                    info!(
                        "Request {} {} rejected before fetch: {}",
                        method, path, error
                    );
                } else {
                    warn!("Request {} {} failed: {}", method, path, error);
                }
                self.annotator.error_response(&error, &decisions)
            }
        };

        if self.access_log_enabled {
            LoggerManager::log_access(&AccessRecord::new(
                &decisions,
                method.as_str(),
                &path,
                response.status().as_u16(),
                started.elapsed(),
            ));
        }

        response
    }

    async fn run(
        &self,
        request: InboundRequest,
        now: DateTime<Utc>,
        decisions: &mut Decisions,
    ) -> Result<Response<ProxyBody>> {
        let plan = self.plan(request, now, decisions)?;
        let class = plan.class;

        let upstream = self
            .fetcher
            .fetch(plan.outbound)
            .await
            .map_err(|e| match e {
                ProxyError::UpstreamFetchFailure(_) => e,
                other => ProxyError::UpstreamFetchFailure(other.to_string()),
            })?;

        checkpoint(
            &decisions.request_id,
            PipelineStage::Fetched,
            &format!("upstream status {}", upstream.status),
        );

        let status = upstream.status;
        decisions.ttl = Some(self.cache_policy.ttl(class, status.as_u16()));

        if matches!(plan.directive, TransformationDirective::Video(_))
            && is_backend_failure(status)
        {
            let detail = read_error_detail(upstream.body, self.error_detail_limit).await;
            return Err(ProxyError::TransformationBackendFailure {
                status: status.as_u16(),
                detail,
            });
        }

        let response = self.annotator.annotate(upstream, decisions);
        checkpoint(&decisions.request_id, PipelineStage::Annotated, "headers added");
        Ok(response)
    }

    /// Decide everything about a request short of fetching it
    ///
    /// Fills `decisions` as each step completes so a failure still reports
    /// what was known at that point.
    pub fn plan(
        &self,
        request: InboundRequest,
        now: DateTime<Utc>,
        decisions: &mut Decisions,
    ) -> Result<FetchPlan> {
        if has_passed_this_proxy(&request.headers) {
            return Err(ProxyError::LoopDetected(format!(
                "{} {} already carries Via {}",
                request.method, request.path, VIA_PSEUDONYM
            )));
        }

        if self.classifier.is_passthrough(&request.path) {
            return Ok(self.plan_passthrough(request, decisions));
        }

        if request.method != Method::GET && request.method != Method::HEAD {
            return Err(ProxyError::MethodNotAllowed(request.method.to_string()));
        }

        let key = ObjectKey::from_path(&request.path)?;
        checkpoint(&decisions.request_id, PipelineStage::KeyExtracted, key.as_str());

        let class = self.classifier.classify(&key);
        decisions.class = Some(class);
        checkpoint(
            &decisions.request_id,
            PipelineStage::Classified,
            &format!("{} ({:?})", class, self.classifier.strategy()),
        );

        let directive = match class {
            MediaClass::Image if !self.images_enabled => TransformationDirective::None,
            _ => self.selector.select(class, request.accept()),
        };
        decisions.directive = Some(directive);
        checkpoint(
            &decisions.request_id,
            PipelineStage::TransformSelected,
            directive.kind(),
        );

        let mode = match directive {
            TransformationDirective::Video(_) => SigningMode::QueryAuth,
            _ => SigningMode::HeaderAuth,
        };
        // The backend always reads the origin with GET; only direct fetches keep HEAD
        let signing_method = match directive {
            TransformationDirective::None => request.method.clone(),
            _ => Method::GET,
        };
        let signed = self
            .signer
            .sign_method(signing_method, &self.bucket, &key, mode, now)?;
        decisions.signing = Some(mode);
        if mode == SigningMode::QueryAuth {
            decisions.signature_expires = Some(presigned_window(&signed, now)?);
        }
        checkpoint(&decisions.request_id, PipelineStage::Signed, mode.as_str());

        let mut headers = forwarded_media_headers(&request.headers);
        let url = match directive.options() {
            Some(options) => {
                let prefix = match directive {
                    TransformationDirective::Video(_) => &self.video_prefix,
                    _ => &self.image_prefix,
                };
                headers.insert(VIA, HeaderValue::from_static(VIA_VALUE));
                build_transform_url(&self.transform_base_url, prefix, &options, &signed.url)
            }
            None => signed.url.clone(),
        };
        for (name, value) in &signed.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }

        Ok(FetchPlan {
            class,
            key: Some(key),
            signed: Some(signed),
            directive,
            outbound: OutboundRequest {
                method: request.method,
                url,
                headers,
                body: Bytes::new(),
            },
        })
    }

    fn plan_passthrough(&self, request: InboundRequest, decisions: &mut Decisions) -> FetchPlan {
        decisions.class = Some(MediaClass::Passthrough);
        decisions.directive = Some(TransformationDirective::None);

        let url = format!("{}{}", self.transform_base_url, request.path_and_query());
        let mut headers = request.headers;
        headers.remove(HOST);
        for name in HOP_BY_HOP_HEADERS {
            headers.remove(*name);
        }
        headers.append(VIA, HeaderValue::from_static(VIA_VALUE));

        debug!("Passthrough {} {}", request.method, url);

        FetchPlan {
            class: MediaClass::Passthrough,
            key: None,
            signed: None,
            directive: TransformationDirective::None,
            outbound: OutboundRequest {
                method: request.method,
                url,
                headers,
                body: request.body,
            },
        }
    }
}

/// Whether a `Via` entry names this proxy as an earlier hop
fn has_passed_this_proxy(headers: &HeaderMap) -> bool {
    headers
        .get_all(VIA)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|hop| hop.split_whitespace().nth(1) == Some(VIA_PSEUDONYM))
}

/// Expiry of the presigned URL actually built, read back from its query
fn presigned_window(signed: &SignedOriginRequest, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let info = parse_presigned_url(&signed.url).ok_or_else(|| {
        ProxyError::SigningFailure("presigned URL carries no signature window".to_string())
    })?;
    if info.signed_at > now || info.is_expired_at(now) {
        return Err(ProxyError::SigningFailure(format!(
            "presigned URL window {} to {} does not cover {}",
            info.signed_at, info.expires_at, now
        )));
    }
    Ok(info.expires_at)
}

/// 304 answers a conditional request and is not a failure
fn is_backend_failure(status: StatusCode) -> bool {
    !status.is_success() && status != StatusCode::NOT_MODIFIED
}

fn forwarded_media_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in FORWARDED_MEDIA_HEADERS {
        if let Some(value) = inbound.get(*name) {
            headers.insert(HeaderName::from_static(*name), value.clone());
        }
    }
    headers
}

/// Read at most `limit` bytes of an error body as lossy UTF-8
async fn read_error_detail(mut body: ProxyBody, limit: usize) -> String {
    let mut buffer = BytesMut::new();
    while buffer.len() < limit {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    buffer.extend_from_slice(&data);
                }
            }
            Some(Err(e)) => {
                debug!("Failed to read transformation error body: {}", e);
                break;
            }
            None => break,
        }
    }
    buffer.truncate(limit);
    String::from_utf8_lossy(&buffer).trim().to_string()
}
