//! Origin Signer Module
//!
//! Produces authenticated GET and HEAD requests for the private object store using AWS
//! Signature Version 4, either in an `Authorization` header (the proxy performs
//! the fetch itself) or as presigned query parameters (the URL is handed as an
//! opaque string to the video transformation backend).
//!
//! The signer is an immutable value built once from configuration; every call
//! takes the signing timestamp explicitly so output is deterministic for
//! identical inputs.

use crate::config::OriginConfig;
use crate::object_key::ObjectKey;
use crate::{ProxyError, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use hyper::Method;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Longest validity SigV4 allows for a presigned URL (7 days)
pub const MAX_PRESIGN_EXPIRES_SECS: u64 = 604_800;

/// RFC 3986 unreserved characters stay literal, everything else is escaped
const URI_UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Where the signature travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigningMode {
    HeaderAuth,
    QueryAuth,
}

impl SigningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningMode::HeaderAuth => "header",
            SigningMode::QueryAuth => "query",
        }
    }
}

impl fmt::Display for SigningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HMAC credential pair for the object store
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.access_key_id.is_empty() {
            return Err(ProxyError::SigningFailure("access key id is empty".to_string()));
        }
        if !self
            .access_key_id
            .chars()
            .all(|c| c.is_ascii_graphic() && c != '/')
        {
            return Err(ProxyError::SigningFailure(
                "access key id contains invalid characters".to_string(),
            ));
        }
        if self.secret_access_key.is_empty() {
            return Err(ProxyError::SigningFailure("secret key is empty".to_string()));
        }
        if self
            .secret_access_key
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(ProxyError::SigningFailure(
                "secret key contains whitespace or control characters".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// A GET request for one object, authenticated for one point in time
#[derive(Debug, Clone)]
pub struct SignedOriginRequest {
    pub method: Method,
    /// Full origin URL; carries the signature in QueryAuth mode
    pub url: String,
    /// Authentication headers (HeaderAuth only); `host` is implied by the URL
    pub headers: Vec<(String, String)>,
    pub mode: SigningMode,
    pub signed_at: DateTime<Utc>,
    /// Validity window in seconds (QueryAuth only)
    pub expires_in: Option<u64>,
}

impl SignedOriginRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Builds signed origin requests from immutable configuration
#[derive(Debug, Clone)]
pub struct OriginSigner {
    scheme: String,
    host: String,
    credentials: Option<Credentials>,
    region: String,
    service: String,
    presign_expires_secs: u64,
}

impl OriginSigner {
    /// Create a signer for `endpoint` (e.g. `https://storage.googleapis.com`)
    pub fn new(
        endpoint: &str,
        credentials: Option<Credentials>,
        region: &str,
        service: &str,
        presign_expires: Duration,
    ) -> Result<Self> {
        let (scheme, rest) = match endpoint.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => ("https".to_string(), endpoint),
        };
        if scheme != "https" && scheme != "http" {
            return Err(ProxyError::ConfigError(format!(
                "Unsupported origin scheme '{}' in {}",
                scheme, endpoint
            )));
        }
        let host = rest.split('/').next().unwrap_or(rest).to_string();
        if host.is_empty() {
            return Err(ProxyError::ConfigError(format!(
                "Origin endpoint has no host: {}",
                endpoint
            )));
        }

        let presign_expires_secs = presign_expires.as_secs().clamp(1, MAX_PRESIGN_EXPIRES_SECS);

        Ok(Self {
            scheme,
            host,
            credentials,
            region: region.to_string(),
            service: service.to_string(),
            presign_expires_secs,
        })
    }

    pub fn from_config(config: &OriginConfig) -> Result<Self> {
        let credentials = match (&config.access_key_id, &config.secret_access_key) {
            (Some(id), Some(secret)) => Some(Credentials::new(id.clone(), secret.clone())),
            _ => None,
        };
        Self::new(
            &config.endpoint,
            credentials,
            &config.region,
            &config.service,
            config.presign_expires,
        )
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn presign_expires_secs(&self) -> u64 {
        self.presign_expires_secs
    }

    /// Unsigned origin URL for an object
    pub fn object_url(&self, bucket: &str, key: &ObjectKey) -> String {
        format!(
            "{}://{}{}",
            self.scheme,
            self.host,
            canonical_object_path(bucket, key)
        )
    }

    /// Sign a GET for `bucket/key` at time `now`
    pub fn sign(
        &self,
        bucket: &str,
        key: &ObjectKey,
        mode: SigningMode,
        now: DateTime<Utc>,
    ) -> Result<SignedOriginRequest> {
        self.sign_method(Method::GET, bucket, key, mode, now)
    }

    /// Sign a GET or HEAD for `bucket/key` at time `now`
    ///
    /// Presigned URLs are always GET: they are fetched by the transformation
    /// backend, never by the proxy.
    pub fn sign_method(
        &self,
        method: Method,
        bucket: &str,
        key: &ObjectKey,
        mode: SigningMode,
        now: DateTime<Utc>,
    ) -> Result<SignedOriginRequest> {
        match (&method, mode) {
            (&Method::GET, _) | (&Method::HEAD, SigningMode::HeaderAuth) => {}
            _ => {
                return Err(ProxyError::SigningFailure(format!(
                    "cannot sign {} with {} auth",
                    method, mode
                )))
            }
        }
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            ProxyError::SigningFailure("object store credentials are not configured".to_string())
        })?;
        credentials.validate()?;
        if bucket.is_empty() || bucket.contains('/') {
            return Err(ProxyError::SigningFailure(format!(
                "invalid bucket name '{}'",
                bucket
            )));
        }

        let context = SigningContext::new(credentials, &self.region, &self.service, now);
        let path = canonical_object_path(bucket, key);

        let signed = match mode {
            SigningMode::HeaderAuth => {
                let headers = context.authorization_headers(method.as_str(), &self.host, &path)?;
                SignedOriginRequest {
                    method,
                    url: format!("{}://{}{}", self.scheme, self.host, path),
                    headers,
                    mode,
                    signed_at: now,
                    expires_in: None,
                }
            }
            SigningMode::QueryAuth => {
                let query = context.presigned_query(&self.host, &path, self.presign_expires_secs)?;
                SignedOriginRequest {
                    method: Method::GET,
                    url: format!("{}://{}{}?{}", self.scheme, self.host, path, query),
                    headers: Vec::new(),
                    mode,
                    signed_at: now,
                    expires_in: Some(self.presign_expires_secs),
                }
            }
        };

        debug!(
            "Signed origin request: mode={}, host={}, path={}, amz_date={}",
            mode, self.host, path, context.amz_date
        );

        Ok(signed)
    }
}

/// `/<bucket>/<key>` with every key segment decoded then canonically re-encoded
fn canonical_object_path(bucket: &str, key: &ObjectKey) -> String {
    let mut path = String::with_capacity(bucket.len() + key.as_str().len() + 2);
    path.push('/');
    path.push_str(&uri_encode(bucket));
    path.push('/');
    let segments: Vec<String> = key
        .as_str()
        .split('/')
        .map(|segment| uri_encode(&percent_decode_str(segment).decode_utf8_lossy()))
        .collect();
    path.push_str(&segments.join("/"));
    path
}

fn uri_encode(value: &str) -> String {
    utf8_percent_encode(value, URI_UNRESERVED).to_string()
}

/// Per-request SigV4 state: credentials plus the timestamp-derived scope
struct SigningContext<'a> {
    credentials: &'a Credentials,
    region: &'a str,
    service: &'a str,
    amz_date: String,
    date: String,
}

impl<'a> SigningContext<'a> {
    fn new(
        credentials: &'a Credentials,
        region: &'a str,
        service: &'a str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            credentials,
            region,
            service,
            amz_date: now.format("%Y%m%dT%H%M%SZ").to_string(),
            date: now.format("%Y%m%d").to_string(),
        }
    }

    fn scope(&self) -> String {
        format!(
            "{}/{}/{}/aws4_request",
            self.date, self.region, self.service
        )
    }

    /// Headers for HeaderAuth: `authorization`, `x-amz-content-sha256`, `x-amz-date`
    fn authorization_headers(
        &self,
        method: &str,
        host: &str,
        path: &str,
    ) -> Result<Vec<(String, String)>> {
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            host, UNSIGNED_PAYLOAD, self.amz_date
        );
        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method, path, canonical_headers, signed_headers, UNSIGNED_PAYLOAD
        );
        let signature = self.signature(&canonical_request)?;

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM,
            self.credentials.access_key_id,
            self.scope(),
            signed_headers,
            signature
        );

        Ok(vec![
            ("authorization".to_string(), authorization),
            (
                "x-amz-content-sha256".to_string(),
                UNSIGNED_PAYLOAD.to_string(),
            ),
            ("x-amz-date".to_string(), self.amz_date.clone()),
        ])
    }

    /// Canonical query string for QueryAuth, `X-Amz-Signature` appended last
    fn presigned_query(&self, host: &str, path: &str, expires_secs: u64) -> Result<String> {
        let mut params = BTreeMap::new();
        params.insert("X-Amz-Algorithm", ALGORITHM.to_string());
        params.insert(
            "X-Amz-Credential",
            format!("{}/{}", self.credentials.access_key_id, self.scope()),
        );
        params.insert("X-Amz-Date", self.amz_date.clone());
        params.insert("X-Amz-Expires", expires_secs.to_string());
        params.insert("X-Amz-SignedHeaders", "host".to_string());

        let canonical_query = params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "GET\n{}\n{}\nhost:{}\n\nhost\n{}",
            path, canonical_query, host, UNSIGNED_PAYLOAD
        );
        let signature = self.signature(&canonical_request)?;

        Ok(format!("{}&X-Amz-Signature={}", canonical_query, signature))
    }

    fn signature(&self, canonical_request: &str) -> Result<String> {
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            self.amz_date,
            self.scope(),
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let secret = format!("AWS4{}", self.credentials.secret_access_key);
        let k_date = hmac_sha256(secret.as_bytes(), self.date.as_bytes())?;
        let k_region = hmac_sha256(&k_date, self.region.as_bytes())?;
        let k_service = hmac_sha256(&k_region, self.service.as_bytes())?;
        let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
        Ok(hex::encode(hmac_sha256(
            &k_signing,
            string_to_sign.as_bytes(),
        )?))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| ProxyError::SigningFailure(format!("invalid HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
