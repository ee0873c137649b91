//! Configuration Module
//!
//! Handles configuration loading from files, environment variables, and command-line arguments.
//! A YAML file provides the base, environment variables override it, and CLI flags override both.

use crate::cache_policy::{CacheTtlByStatus, DO_NOT_CACHE};
use crate::classifier::ClassificationStrategy;
use crate::transform::{OriginAuth, VideoFit};
use crate::{ProxyError, Result};
use clap::{Arg, Command};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        // Find where the number ends and the unit begins
        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let duration = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" | "" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            "d" | "day" | "days" => Duration::from_secs_f64(value * 86400.0),
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Ok(duration)
    }
}

/// Host and port of an absolute http(s) URL, loopback names folded together
pub fn url_authority(url: &str) -> Option<(String, u16)> {
    let uri: hyper::Uri = url.parse().ok()?;
    let default_port = match uri.scheme_str()? {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };
    let host = uri
        .host()?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    let host = match host.as_str() {
        "127.0.0.1" | "::1" | "0.0.0.0" | "::" => "localhost".to_string(),
        _ => host,
    };
    Some((host, uri.port_u16().unwrap_or(default_port)))
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub origin: OriginConfig,
    #[serde(default)]
    pub classification: ClassificationStrategy,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Maximum number of requests handled at once; further requests get 429
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Largest passthrough request body accepted; larger bodies get 413
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,
    /// Externally visible base URL of this proxy; the transformation backend must not share its host
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

fn default_http_port() -> u16 {
    8080
}

fn default_max_concurrent_requests() -> usize {
    200
}

fn default_max_request_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            max_concurrent_requests: default_max_concurrent_requests(),
            max_request_body_bytes: default_max_request_body_bytes(),
            public_base_url: default_public_base_url(),
        }
    }
}

/// Private object store configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key_id: Option<String>,
    #[serde(skip_serializing)]
    pub secret_access_key: Option<String>,
    pub region: String,
    pub service: String,
    /// Validity window of presigned URLs
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub presign_expires: Duration,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://storage.googleapis.com".to_string(),
            bucket: String::new(),
            access_key_id: None,
            secret_access_key: None,
            region: "auto".to_string(),
            service: "s3".to_string(),
            presign_expires: Duration::from_secs(86400),
        }
    }
}

impl fmt::Debug for OriginConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginConfig")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("region", &self.region)
            .field("service", &self.service)
            .field("presign_expires", &self.presign_expires)
            .finish()
    }
}

impl OriginConfig {
    pub fn has_credentials(&self) -> bool {
        matches!(
            (&self.access_key_id, &self.secret_access_key),
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty()
        )
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(self.endpoint.starts_with("https://") || self.endpoint.starts_with("http://")) {
            return Err(format!(
                "Origin endpoint must start with http:// or https://, got {}",
                self.endpoint
            ));
        }
        if self.bucket.contains('/') {
            return Err(format!("Bucket name must not contain '/': {}", self.bucket));
        }
        if self.region.is_empty() || self.service.is_empty() {
            return Err("Origin region and service must not be empty".to_string());
        }
        if self.presign_expires.as_secs() == 0 {
            return Err("Presign expiry must be at least one second".to_string());
        }
        Ok(())
    }
}

/// Transformation backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Paths under this prefix belong to the backend and are forwarded unchanged
    pub passthrough_prefix: String,
    /// Base URL of the transformation backend, a separate service from this proxy
    pub backend_base_url: String,
    pub image_prefix: String,
    pub video_prefix: String,
    /// Route images through the image backend; otherwise fetch the origin directly
    pub images_enabled: bool,
    pub image_quality: u8,
    pub origin_auth: OriginAuth,
    pub video_width: u32,
    pub video_fit: VideoFit,
    /// Bytes of a failed backend response body copied into `x-transform-error`
    pub error_detail_limit: usize,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            passthrough_prefix: "/cdn-cgi/".to_string(),
            backend_base_url: "http://localhost:8788".to_string(),
            image_prefix: "cdn-cgi/image".to_string(),
            video_prefix: "cdn-cgi/media".to_string(),
            images_enabled: true,
            image_quality: 85,
            origin_auth: OriginAuth::SharePublicly,
            video_width: 720,
            video_fit: VideoFit::Contain,
            error_detail_limit: 256,
        }
    }
}

impl TransformConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.image_quality == 0 || self.image_quality > 100 {
            return Err(format!(
                "Image quality must be between 1 and 100, got {}",
                self.image_quality
            ));
        }
        if self.video_width == 0 {
            return Err("Video width must be greater than 0".to_string());
        }
        if self.image_prefix.trim_matches('/').is_empty()
            || self.video_prefix.trim_matches('/').is_empty()
        {
            return Err("Transformation prefixes must not be empty".to_string());
        }
        if url_authority(&self.backend_base_url).is_none() {
            return Err(format!(
                "Transformation backend URL must be an absolute http(s) URL, got {}",
                self.backend_base_url
            ));
        }
        if !self.passthrough_prefix.is_empty() && !self.passthrough_prefix.starts_with('/') {
            return Err(format!(
                "Passthrough prefix must start with '/', got {}",
                self.passthrough_prefix
            ));
        }
        Ok(())
    }
}

/// Cache lifetimes per media class
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub image: CacheTtlByStatus,
    pub video: CacheTtlByStatus,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            image: CacheTtlByStatus {
                success: 30,
                not_found: 300,
            },
            video: CacheTtlByStatus {
                success: 86400,
                not_found: DO_NOT_CACHE,
            },
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    /// Directory for daily-rolling application logs; console only when unset
    pub app_log_dir: Option<PathBuf>,
    pub access_log_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            app_log_dir: None,
            access_log_enabled: true,
        }
    }
}

/// Health check server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8081,
        }
    }
}

impl Config {
    /// Load configuration from file, environment, and command line
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();

        let mut config = match matches.get_one::<String>("config") {
            Some(config_path) => Self::load_from_file(config_path)?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&matches);
        config.validate()?;

        if config.origin.bucket.is_empty() {
            warn!("No bucket configured (GCS_BUCKET); every media request will fail signing");
        }
        if !config.origin.has_credentials() {
            warn!(
                "Object store credentials missing (GCS_HMAC_ACCESS_KEY_ID / GCS_HMAC_SECRET_ACCESS_KEY); every media request will fail signing"
            );
        }

        info!(
            "Origin: endpoint={}, bucket={}, region={}, presign_expires={}s",
            config.origin.endpoint,
            config.origin.bucket,
            config.origin.region,
            config.origin.presign_expires.as_secs()
        );
        info!(
            "Classification strategy: {:?}, passthrough prefix: {}",
            config.classification, config.transform.passthrough_prefix
        );
        info!(
            "Transform: images_enabled={}, quality={}, video_width={}, backend={}",
            config.transform.images_enabled,
            config.transform.image_quality,
            config.transform.video_width,
            config.transform_base_url()
        );
        info!(
            "Cache TTLs: image 2xx={}s 404={}s, video 2xx={}s 404={}s, 5xx never cached",
            config.cache.image.success,
            config.cache.image.not_found,
            config.cache.video.success,
            config.cache.video.not_found
        );

        info!("Configuration loaded successfully");
        debug!("Configuration: {:?}", config);

        Ok(config)
    }

    /// Base URL of the transformation backend
    pub fn transform_base_url(&self) -> &str {
        &self.transform.backend_base_url
    }

    /// Build CLI argument parser
    fn build_cli() -> Command {
        Command::new("media-edge-proxy")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Edge proxy for media stored in a private S3-compatible bucket")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("http-port")
                    .long("http-port")
                    .value_name("PORT")
                    .help("HTTP port (default: 8080)"),
            )
            .arg(
                Arg::new("bucket")
                    .long("bucket")
                    .value_name("NAME")
                    .help("Object store bucket"),
            )
            .arg(
                Arg::new("origin-endpoint")
                    .long("origin-endpoint")
                    .value_name("URL")
                    .help("Object store endpoint (default: https://storage.googleapis.com)"),
            )
            .arg(
                Arg::new("public-base-url")
                    .long("public-base-url")
                    .value_name("URL")
                    .help("Externally visible base URL used for transformation requests"),
            )
            .arg(
                Arg::new("transform-backend-url")
                    .long("transform-backend-url")
                    .value_name("URL")
                    .help("Base URL of the transformation backend (default: http://localhost:8788)"),
            )
            .arg(
                Arg::new("classification")
                    .long("classification")
                    .value_name("STRATEGY")
                    .help("Video detection strategy: extension or mime-lookup"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level filter (default: info)"),
            )
    }

    /// Load configuration from YAML file
    fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config = Self::from_yaml_str(&content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        info!("Configuration loaded from file: {}", path);
        Ok(config)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any variable source (environment in production)
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("GCS_HMAC_ACCESS_KEY_ID") {
            self.origin.access_key_id = Some(id);
        }
        if let Some(secret) = lookup("GCS_HMAC_SECRET_ACCESS_KEY") {
            self.origin.secret_access_key = Some(secret);
        }
        if let Some(bucket) = lookup("GCS_BUCKET") {
            self.origin.bucket = bucket;
        }
        if let Some(endpoint) = lookup("ORIGIN_ENDPOINT") {
            self.origin.endpoint = endpoint;
        }
        if let Some(region) = lookup("ORIGIN_REGION") {
            self.origin.region = region;
        }
        if let Some(url) = lookup("PUBLIC_BASE_URL") {
            self.server.public_base_url = url;
        }
        if let Some(url) = lookup("TRANSFORM_BACKEND_URL") {
            self.transform.backend_base_url = url;
        }
        if let Some(port) = lookup("HTTP_PORT") {
            if let Ok(port) = port.parse() {
                self.server.http_port = port;
            }
        }
        if let Some(port) = lookup("HEALTH_PORT") {
            if let Ok(port) = port.parse() {
                self.health.port = port;
            }
        }
        if let Some(max_requests) = lookup("MAX_CONCURRENT_REQUESTS") {
            if let Ok(max_requests) = max_requests.parse() {
                self.server.max_concurrent_requests = max_requests;
            }
        }
        if let Some(max_body) = lookup("MAX_REQUEST_BODY_BYTES") {
            if let Ok(max_body) = max_body.parse() {
                self.server.max_request_body_bytes = max_body;
            }
        }
        if let Some(log_level) = lookup("LOG_LEVEL") {
            self.logging.log_level = log_level;
        }
        if let Some(dir) = lookup("APP_LOG_DIR") {
            self.logging.app_log_dir = Some(PathBuf::from(dir));
        }
        if let Some(strategy) = lookup("CLASSIFICATION_STRATEGY") {
            match strategy.parse() {
                Ok(strategy) => self.classification = strategy,
                Err(e) => warn!("Ignoring CLASSIFICATION_STRATEGY: {}", e),
            }
        }
    }

    /// Apply command line argument overrides
    fn apply_cli_overrides(&mut self, matches: &clap::ArgMatches) {
        if let Some(port) = matches.get_one::<String>("http-port") {
            if let Ok(port) = port.parse() {
                self.server.http_port = port;
            }
        }
        if let Some(bucket) = matches.get_one::<String>("bucket") {
            self.origin.bucket = bucket.clone();
        }
        if let Some(endpoint) = matches.get_one::<String>("origin-endpoint") {
            self.origin.endpoint = endpoint.clone();
        }
        if let Some(url) = matches.get_one::<String>("public-base-url") {
            self.server.public_base_url = url.clone();
        }
        if let Some(url) = matches.get_one::<String>("transform-backend-url") {
            self.transform.backend_base_url = url.clone();
        }
        if let Some(strategy) = matches.get_one::<String>("classification") {
            match strategy.parse() {
                Ok(strategy) => self.classification = strategy,
                Err(e) => warn!("Ignoring --classification: {}", e),
            }
        }
        if let Some(log_level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = log_level.clone();
        }
    }

    /// Validate all sections
    pub fn validate(&self) -> Result<()> {
        let base = &self.server.public_base_url;
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ProxyError::ConfigError(format!(
                "Public base URL must start with http:// or https://, got {}",
                base
            )));
        }
        if self.server.max_concurrent_requests == 0 {
            return Err(ProxyError::ConfigError(
                "max_concurrent_requests must be greater than 0".to_string(),
            ));
        }
        if let Err(e) = self.origin.validate() {
            return Err(ProxyError::ConfigError(format!(
                "Invalid origin configuration: {}",
                e
            )));
        }
        if let Err(e) = self.transform.validate() {
            return Err(ProxyError::ConfigError(format!(
                "Invalid transform configuration: {}",
                e
            )));
        }
        // Transformation requests sent to this proxy come straight back as passthrough
        if url_authority(self.transform_base_url()) == url_authority(base) {
            return Err(ProxyError::ConfigError(format!(
                "Transformation backend {} points at this proxy ({})",
                self.transform_base_url(),
                base
            )));
        }
        if let Err(e) = self.cache.image.validate() {
            return Err(ProxyError::ConfigError(format!(
                "Invalid image cache configuration: {}",
                e
            )));
        }
        if let Err(e) = self.cache.video.validate() {
            return Err(ProxyError::ConfigError(format!(
                "Invalid video cache configuration: {}",
                e
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::duration_serde::parse_duration;
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("7 days").unwrap(), Duration::from_secs(604800));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("3 fortnights").is_err());
    }

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transform_base_url(), "http://localhost:8788");
        assert!(!config.origin.has_credentials());
    }

    #[test]
    fn test_url_authority() {
        assert_eq!(
            url_authority("https://Media.Example.com/x"),
            Some(("media.example.com".to_string(), 443))
        );
        assert_eq!(
            url_authority("http://127.0.0.1:8080"),
            url_authority("http://localhost:8080/")
        );
        assert_eq!(url_authority("http://[::1]:9000"), Some(("localhost".to_string(), 9000)));
        assert!(url_authority("media.example.com").is_none());
        assert!(url_authority("ftp://host/").is_none());
    }

    #[test]
    fn test_backend_on_proxy_host_is_rejected() {
        let mut config = Config::default();
        config.transform.backend_base_url = "http://127.0.0.1:8080/".to_string();
        assert!(matches!(config.validate(), Err(ProxyError::ConfigError(_))));

        config.transform.backend_base_url = "http://localhost:8081".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let mut config = Config::default();
        config.origin.secret_access_key = Some("super-secret-value".to_string());
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("super-secret-value"));
    }
}
