//! Error Module
//!
//! Defines error types and result types used throughout the media edge proxy.

use hyper::StatusCode;
use thiserror::Error;

/// Main error type for the media edge proxy
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("Empty object key")]
    EmptyKey,

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Request loop detected: {0}")]
    LoopDetected(String),

    #[error("Signing failure: {0}")]
    SigningFailure(String),

    #[error("Upstream fetch failure: {0}")]
    UpstreamFetchFailure(String),

    #[error("Transformation backend returned {status}: {detail}")]
    TransformationBackendFailure { status: u16, detail: String },

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl ProxyError {
    /// HTTP status returned to the client when this error ends a request
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::EmptyKey => StatusCode::NOT_FOUND,
            ProxyError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::LoopDetected(_) => StatusCode::LOOP_DETECTED,
            // Backend status is passed through; an out-of-range code degrades to 500
            ProxyError::TransformationBackendFailure { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable code used in the `x-proxy-error` header
    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::EmptyKey => "EmptyKey",
            ProxyError::MethodNotAllowed(_) => "MethodNotAllowed",
            ProxyError::LoopDetected(_) => "LoopDetected",
            ProxyError::SigningFailure(_) => "SigningFailure",
            ProxyError::UpstreamFetchFailure(_)
            | ProxyError::ConnectionError(_)
            | ProxyError::TlsError(_)
            | ProxyError::TimeoutError(_) => "UpstreamFetchFailure",
            ProxyError::TransformationBackendFailure { .. } => "TransformationBackendFailure",
            _ => "InternalError",
        }
    }

    /// Whether the failure happened before any upstream request was issued
    pub fn is_pre_fetch(&self) -> bool {
        matches!(
            self,
            ProxyError::EmptyKey
                | ProxyError::MethodNotAllowed(_)
                | ProxyError::LoopDetected(_)
                | ProxyError::SigningFailure(_)
        )
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

/// Result type alias for the media edge proxy
pub type Result<T> = std::result::Result<T, ProxyError>;
