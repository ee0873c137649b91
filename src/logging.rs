//! Logging Module
//!
//! Sets up application logging (console plus an optional daily-rolling file)
//! and emits one structured access event per request.

use crate::annotator::Decisions;
use crate::config::LoggingConfig;
use crate::{ProxyError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tracing target for access events
pub const ACCESS_TARGET: &str = "access";

/// Application log file name prefix
const APP_LOG_FILE: &str = "media-edge-proxy.log";

/// One served request, serialized as a JSON access event
#[derive(Debug, Clone, Serialize)]
pub struct AccessRecord {
    pub time: DateTime<Utc>,
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub media_class: Option<&'static str>,
    pub origin_signing: Option<&'static str>,
    pub transform: Option<&'static str>,
    pub cache_ttl: Option<i64>,
    pub duration_ms: u64,
}

impl AccessRecord {
    pub fn new(
        decisions: &Decisions,
        method: &str,
        path: &str,
        status: u16,
        duration: Duration,
    ) -> Self {
        Self {
            time: Utc::now(),
            request_id: decisions.request_id.clone(),
            method: method.to_string(),
            path: path.to_string(),
            status,
            media_class: decisions.class.map(|c| c.as_str()),
            origin_signing: decisions.signing.map(|m| m.as_str()),
            transform: decisions.directive.map(|d| d.kind()),
            cache_ttl: decisions.ttl,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Logger manager for application and access logging
pub struct LoggerManager {
    pub config: LoggingConfig,
    hostname: String,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig, hostname: String) -> Self {
        Self { config, hostname }
    }

    /// Initialize the global tracing subscriber
    pub fn initialize(&self) -> Result<()> {
        // RUST_LOG overrides the configured level
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.log_level));

        let file_layer = match &self.config.app_log_dir {
            Some(dir) => {
                let host_log_dir = dir.join(&self.hostname);
                std::fs::create_dir_all(&host_log_dir).map_err(|e| {
                    ProxyError::IoError(format!("Failed to create app log directory: {}", e))
                })?;
                let file_appender =
                    RollingFileAppender::new(Rotation::DAILY, host_log_dir, APP_LOG_FILE);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_appender)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                        .compact(),
                )
            }
            None => None,
        };

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(_) => {
                info!("Logging initialized for host: {}", self.hostname);
                if let Some(dir) = &self.config.app_log_dir {
                    info!("Application logs will be written to: {:?}", dir.join(&self.hostname));
                }
            }
            Err(_) => {
                // Already initialized (tests)
                debug!("Tracing subscriber already initialized, skipping");
            }
        }

        Ok(())
    }

    /// Remove application log files older than `keep_days`
    pub fn cleanup_old_logs(&self, keep_days: u32) -> Result<usize> {
        match &self.config.app_log_dir {
            Some(dir) => remove_files_older_than(
                &dir.join(&self.hostname),
                Duration::from_secs(keep_days as u64 * 24 * 3600),
            ),
            None => Ok(0),
        }
    }

    /// Emit one access event
    pub fn log_access(record: &AccessRecord) {
        match record.to_json() {
            Ok(json) => info!(target: ACCESS_TARGET, "{}", json),
            Err(e) => warn!("Failed to serialize access record {}: {}", record.request_id, e),
        }
    }
}

fn remove_files_older_than(dir: &Path, max_age: Duration) -> Result<usize> {
    let cutoff_time = std::time::SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(std::time::UNIX_EPOCH);

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(0),
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        if modified < cutoff_time {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                warn!("Failed to remove old log file {:?}: {}", entry.path(), e);
            } else {
                debug!("Removed old log file: {:?}", entry.path());
                removed += 1;
            }
        }
    }

    Ok(removed)
}
