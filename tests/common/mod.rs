//! Shared helpers for integration tests

#![allow(dead_code)]

use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::StatusCode;
use media_edge_proxy::config::Config;
use media_edge_proxy::orchestrator::{
    full_body, OutboundRequest, UpstreamFetcher, UpstreamResponse,
};
use media_edge_proxy::{ProxyError, Result};
use std::sync::{Arc, Mutex};

/// Canned upstream answer
#[derive(Debug, Clone)]
pub struct CannedResponse {
    pub status: StatusCode,
    pub headers: Vec<(&'static str, &'static str)>,
    pub body: Bytes,
}

impl CannedResponse {
    pub fn new(status: u16, body: &'static [u8]) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap(),
            headers: Vec::new(),
            body: Bytes::from_static(body),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers.push((name, value));
        self
    }
}

/// Fetcher that records every outbound request and answers from a script
#[derive(Clone)]
pub struct RecordingFetcher {
    requests: Arc<Mutex<Vec<OutboundRequest>>>,
    response: Arc<Mutex<Option<CannedResponse>>>,
}

impl RecordingFetcher {
    /// Answers every request with `response`
    pub fn answering(response: CannedResponse) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            response: Arc::new(Mutex::new(Some(response))),
        }
    }

    /// Fails every request at the connection level
    pub fn failing() -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            response: Arc::new(Mutex::new(None)),
        }
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl UpstreamFetcher for RecordingFetcher {
    async fn fetch(&self, request: OutboundRequest) -> Result<UpstreamResponse> {
        self.requests.lock().unwrap().push(request);
        let canned = self.response.lock().unwrap().clone();
        match canned {
            Some(canned) => {
                let mut headers = HeaderMap::new();
                for (name, value) in canned.headers {
                    headers.insert(
                        HeaderName::from_static(name),
                        HeaderValue::from_static(value),
                    );
                }
                Ok(UpstreamResponse::new(
                    canned.status,
                    headers,
                    full_body(canned.body),
                ))
            }
            None => Err(ProxyError::ConnectionError(
                "connection refused".to_string(),
            )),
        }
    }
}

/// Configuration with credentials, bucket and a transformation backend apart from the proxy
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.public_base_url = "https://media.example.com".to_string();
    config.transform.backend_base_url = "https://transform.example.com".to_string();
    config.origin.bucket = "media-bucket".to_string();
    config.origin.access_key_id = Some("GOOGTS7C7FUP3AIRVJTE2BCD".to_string());
    config.origin.secret_access_key = Some("bGoa+V7g/yqDXvKRqq+JTFn4uQZbPiQJo4pf9RzJ".to_string());
    config.logging.access_log_enabled = false;
    config
}
