//! Media Edge Proxy - serves media from a credential-gated S3-compatible store
//!
//! This library provides the request pipeline (key extraction, classification,
//! origin signing, transformation selection, cache policy, annotation) and the
//! hyper-based serving shell around it.

pub mod annotator;
pub mod cache_policy;
pub mod classifier;
pub mod config;
pub mod error;
pub mod health;
pub mod http_proxy;
pub mod https_connector;
pub mod logging;
pub mod object_key;
pub mod orchestrator;
pub mod origin_client;
pub mod origin_signer;
pub mod presigned_url;
pub mod shutdown;
pub mod transform;

pub use error::{ProxyError, Result};
