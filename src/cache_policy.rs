//! Cache Policy Module
//!
//! Maps a response status to the TTL handed to the external edge cache.
//! The mapper is pure: it states intent, it does not store anything.

use crate::classifier::MediaClass;
use serde::{Deserialize, Serialize};

/// TTL value meaning "do not cache"
pub const DO_NOT_CACHE: i64 = -1;

/// Status-code ranges that carry distinct cache lifetimes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBucket {
    /// 200-299
    Success,
    /// 404
    NotFound,
    /// 500-599
    ServerError,
    Other,
}

impl StatusBucket {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => StatusBucket::Success,
            404 => StatusBucket::NotFound,
            500..=599 => StatusBucket::ServerError,
            _ => StatusBucket::Other,
        }
    }
}

/// TTLs (seconds) per status bucket for one media class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTtlByStatus {
    pub success: i64,
    /// Short positive TTL, or -1 when missing objects must not be cached
    pub not_found: i64,
}

impl CacheTtlByStatus {
    pub fn ttl_for(&self, status: u16) -> i64 {
        match StatusBucket::from_status(status) {
            StatusBucket::Success => self.success,
            StatusBucket::NotFound => self.not_found,
            StatusBucket::ServerError | StatusBucket::Other => DO_NOT_CACHE,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.success <= 0 {
            return Err(format!(
                "Success TTL must be a positive number of seconds, got {}",
                self.success
            ));
        }
        if self.not_found < DO_NOT_CACHE || self.not_found == 0 {
            return Err(format!(
                "Not-found TTL must be positive or -1, got {}",
                self.not_found
            ));
        }
        Ok(())
    }
}

/// Per-class cache lifetimes
#[derive(Debug, Clone)]
pub struct CachePolicyMapper {
    image: CacheTtlByStatus,
    video: CacheTtlByStatus,
}

impl CachePolicyMapper {
    pub fn new(image: CacheTtlByStatus, video: CacheTtlByStatus) -> Self {
        Self { image, video }
    }

    pub fn ttl(&self, class: MediaClass, status: u16) -> i64 {
        match class {
            MediaClass::Image => self.image.ttl_for(status),
            MediaClass::Mp4Video | MediaClass::OtherVideo => self.video.ttl_for(status),
            MediaClass::Passthrough => DO_NOT_CACHE,
        }
    }
}

/// `CDN-Cache-Control` value conveying a TTL to the edge cache
pub fn cdn_cache_control(ttl: i64) -> String {
    if ttl < 0 {
        "no-store".to_string()
    } else {
        format!("max-age={}", ttl)
    }
}
