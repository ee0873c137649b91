//! Health Check Module
//!
//! Reports whether the proxy is able to serve media: origin credentials and
//! bucket present, transformation backend configured.

use crate::config::Config;
use crate::{ProxyError, Result};
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

/// Health check status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Component health information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

/// Overall system health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub timestamp: SystemTime,
    pub version: String,
    pub components: Vec<ComponentHealth>,
    pub uptime_seconds: u64,
}

/// Health check manager
pub struct HealthManager {
    start_time: SystemTime,
    components: Vec<ComponentHealth>,
    last_health_check: Arc<RwLock<Option<SystemHealth>>>,
}

impl HealthManager {
    /// Create a health manager; component state is derived once from configuration
    pub fn new(config: &Config) -> Self {
        Self {
            start_time: SystemTime::now(),
            components: vec![
                Self::check_credentials(config),
                Self::check_bucket(config),
                Self::check_transform_backend(config),
            ],
            last_health_check: Arc::new(RwLock::new(None)),
        }
    }

    fn check_credentials(config: &Config) -> ComponentHealth {
        if config.origin.has_credentials() {
            ComponentHealth {
                name: "origin_credentials".to_string(),
                status: HealthStatus::Healthy,
                message: Some(format!(
                    "Signing for {} ({}/{})",
                    config.origin.endpoint, config.origin.region, config.origin.service
                )),
            }
        } else {
            ComponentHealth {
                name: "origin_credentials".to_string(),
                status: HealthStatus::Degraded,
                message: Some("Object store credentials are not configured".to_string()),
            }
        }
    }

    fn check_bucket(config: &Config) -> ComponentHealth {
        let (status, message) = if config.origin.bucket.is_empty() {
            (HealthStatus::Degraded, "No bucket configured".to_string())
        } else {
            (
                HealthStatus::Healthy,
                format!("Bucket: {}", config.origin.bucket),
            )
        };
        ComponentHealth {
            name: "bucket".to_string(),
            status,
            message: Some(message),
        }
    }

    fn check_transform_backend(config: &Config) -> ComponentHealth {
        ComponentHealth {
            name: "transform_backend".to_string(),
            status: HealthStatus::Healthy,
            message: Some(format!(
                "Backend: {} (images {})",
                config.transform_base_url(),
                if config.transform.images_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            )),
        }
    }

    /// Build the current health report
    pub async fn check_health(&self) -> SystemHealth {
        let uptime = self
            .start_time
            .elapsed()
            .unwrap_or(Duration::from_secs(0))
            .as_secs();

        let health = SystemHealth {
            status: self.determine_overall_status(&self.components),
            timestamp: SystemTime::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            components: self.components.clone(),
            uptime_seconds: uptime,
        };

        {
            let mut last_check = self.last_health_check.write().await;
            *last_check = Some(health.clone());
        }

        health
    }

    /// Determine overall system status from component statuses
    fn determine_overall_status(&self, components: &[ComponentHealth]) -> HealthStatus {
        if components
            .iter()
            .any(|c| c.status == HealthStatus::Unhealthy)
        {
            HealthStatus::Unhealthy
        } else if components.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Handle health check HTTP request
    pub async fn handle_health_request<B>(&self, _req: Request<B>) -> Result<Response<String>> {
        let health = self.check_health().await;

        let status_code = match health.status {
            HealthStatus::Healthy => StatusCode::OK,
            HealthStatus::Degraded => StatusCode::OK, // Still return 200 for degraded
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        };

        let body = serde_json::to_string_pretty(&health).map_err(|e| {
            ProxyError::SerializationError(format!("Failed to serialize health status: {}", e))
        })?;

        Response::builder()
            .status(status_code)
            .header("Content-Type", "application/json")
            .body(body)
            .map_err(|e| ProxyError::HttpError(format!("Failed to build health response: {}", e)))
    }

    /// Get cached health status (non-blocking)
    pub async fn get_cached_health(&self) -> Option<SystemHealth> {
        self.last_health_check.read().await.clone()
    }
}
