//! Response Annotator Module
//!
//! Decorates upstream responses with diagnostic headers describing the
//! decisions made for the request. Headers are only ever added: a header the
//! upstream already set is left untouched, and the body stream is passed on
//! as-is.

use crate::cache_policy::{cdn_cache_control, DO_NOT_CACHE};
use crate::classifier::MediaClass;
use crate::orchestrator::{full_body, ProxyBody, UpstreamResponse};
use crate::origin_signer::SigningMode;
use crate::transform::TransformationDirective;
use crate::ProxyError;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::Response;
use tracing::debug;

/// Diagnostic header names
pub mod headers {
    pub const MEDIA_CLASS: &str = "x-media-class";
    pub const REQUESTED_FORMAT: &str = "x-requested-format";
    pub const ORIGIN_SIGNING: &str = "x-origin-signing";
    pub const UPSTREAM_STATUS: &str = "x-upstream-status";
    pub const MEDIA_TRANSFORM: &str = "x-media-transform";
    pub const CACHE_TTL: &str = "x-cache-ttl";
    pub const REQUEST_ID: &str = "x-request-id";
    pub const SIGNATURE_EXPIRES: &str = "x-origin-signature-expires";
    pub const PROXY_ERROR: &str = "x-proxy-error";
    pub const TRANSFORM_ERROR: &str = "x-transform-error";
    /// Cache lifetime published to the external edge cache
    pub const CDN_CACHE_CONTROL: &str = "cdn-cache-control";
}

/// Decisions taken while handling one request
#[derive(Debug, Clone, Default)]
pub struct Decisions {
    pub request_id: String,
    pub class: Option<MediaClass>,
    pub signing: Option<SigningMode>,
    pub directive: Option<TransformationDirective>,
    pub ttl: Option<i64>,
    pub signature_expires: Option<DateTime<Utc>>,
}

impl Decisions {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Default::default()
        }
    }

    /// `avif`, `webp` or `original`; only meaningful for images
    pub fn requested_format(&self) -> Option<&'static str> {
        match (self.class, self.directive) {
            (Some(MediaClass::Image), Some(TransformationDirective::Image(image))) => {
                Some(image.format.map(|f| f.as_str()).unwrap_or("original"))
            }
            (Some(MediaClass::Image), _) => Some("original"),
            _ => None,
        }
    }
}

/// Adds diagnostic headers to responses
#[derive(Debug, Clone, Default)]
pub struct ResponseAnnotator;

impl ResponseAnnotator {
    pub fn new() -> Self {
        Self
    }

    /// Turn an upstream response into the client response, adding headers only
    pub fn annotate(&self, upstream: UpstreamResponse, decisions: &Decisions) -> Response<ProxyBody> {
        let UpstreamResponse {
            status,
            headers: upstream_headers,
            body,
        } = upstream;

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = upstream_headers;

        let headers = response.headers_mut();
        add_if_absent(headers, headers::UPSTREAM_STATUS, status.as_u16().to_string());
        self.add_decision_headers(headers, decisions);

        debug!(
            "Annotated response: request_id={}, status={}, class={:?}, ttl={:?}",
            decisions.request_id, status, decisions.class, decisions.ttl
        );

        response
    }

    /// Build a complete response for a request that failed
    pub fn error_response(&self, error: &ProxyError, decisions: &Decisions) -> Response<ProxyBody> {
        let status = error.status_code();
        let mut response = Response::new(full_body(Bytes::from(format!("{}\n", error))));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        add_if_absent(headers, headers::PROXY_ERROR, error.error_code().to_string());
        if let ProxyError::TransformationBackendFailure { status, detail } = error {
            add_if_absent(headers, headers::UPSTREAM_STATUS, status.to_string());
            add_if_absent(headers, headers::TRANSFORM_ERROR, sanitize_header_text(detail));
        }

        let mut decisions = decisions.clone();
        if decisions.ttl.is_none() {
            decisions.ttl = Some(DO_NOT_CACHE);
        }
        self.add_decision_headers(headers, &decisions);

        debug!(
            "Built error response: request_id={}, status={}, error={}",
            decisions.request_id,
            status,
            error.error_code()
        );

        response
    }

    fn add_decision_headers(&self, headers: &mut HeaderMap, decisions: &Decisions) {
        add_if_absent(headers, headers::REQUEST_ID, decisions.request_id.clone());
        if let Some(class) = decisions.class {
            add_if_absent(headers, headers::MEDIA_CLASS, class.as_str().to_string());
        }
        if let Some(format) = decisions.requested_format() {
            add_if_absent(headers, headers::REQUESTED_FORMAT, format.to_string());
        }
        if let Some(mode) = decisions.signing {
            add_if_absent(headers, headers::ORIGIN_SIGNING, mode.as_str().to_string());
        }
        if let Some(directive) = decisions.directive {
            add_if_absent(headers, headers::MEDIA_TRANSFORM, directive.kind().to_string());
        }
        if let Some(expires) = decisions.signature_expires {
            add_if_absent(
                headers,
                headers::SIGNATURE_EXPIRES,
                expires.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        }
        if let Some(ttl) = decisions.ttl {
            add_if_absent(headers, headers::CACHE_TTL, ttl.to_string());
            add_if_absent(headers, headers::CDN_CACHE_CONTROL, cdn_cache_control(ttl));
        }
    }
}

/// Insert `name: value` unless the header is already present
fn add_if_absent(headers: &mut HeaderMap, name: &'static str, value: String) {
    let name = HeaderName::from_static(name);
    if headers.contains_key(&name) {
        return;
    }
    match HeaderValue::from_str(&value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(e) => debug!("Skipping diagnostic header {}: {}", name, e),
    }
}

/// Collapse text into a single visible-ASCII header line
fn sanitize_header_text(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii_graphic() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
