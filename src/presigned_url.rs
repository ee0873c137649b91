//! Presigned URL parsing
//!
//! Reads the SigV4 query parameters back out of a presigned origin URL. The
//! orchestrator checks every URL it hands to the video backend this way and
//! reports the window it finds, so the diagnostic header describes the URL
//! actually sent rather than the signer's settings.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Presigned URL information extracted from query parameters
#[derive(Debug, Clone)]
pub struct PresignedUrlInfo {
    /// When the URL was signed (X-Amz-Date)
    pub signed_at: DateTime<Utc>,
    /// Validity duration in seconds (X-Amz-Expires)
    pub expires_in_seconds: u64,
    /// Calculated expiration time
    pub expires_at: DateTime<Utc>,
}

impl PresignedUrlInfo {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Split a query string into decoded key/value pairs
fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (
                percent_decode_str(k).decode_utf8_lossy().into_owned(),
                percent_decode_str(v).decode_utf8_lossy().into_owned(),
            )
        })
        .collect()
}

/// Parse presigned URL information from a full URL
///
/// Returns None if the URL carries no SigV4 query parameters
pub fn parse_presigned_url(url: &str) -> Option<PresignedUrlInfo> {
    let (_, query) = url.split_once('?')?;
    parse_presigned_params(&parse_query(query))
}

/// Parse presigned URL information from decoded query parameters
fn parse_presigned_params(query_params: &HashMap<String, String>) -> Option<PresignedUrlInfo> {
    if !query_params.contains_key("X-Amz-Algorithm") {
        return None;
    }

    let signed_at = parse_amz_date(query_params.get("X-Amz-Date")?)?;
    let expires_in_seconds: u64 = query_params.get("X-Amz-Expires")?.parse().ok()?;
    let expires_at = signed_at + Duration::seconds(expires_in_seconds as i64);

    debug!(
        "Parsed presigned URL: signed_at={}, expires_in={}s, expires_at={}",
        signed_at, expires_in_seconds, expires_at
    );

    Some(PresignedUrlInfo {
        signed_at,
        expires_in_seconds,
        expires_at,
    })
}

/// Parse AWS X-Amz-Date format (ISO 8601 basic format: YYYYMMDDTHHMMSSZ)
fn parse_amz_date(date_str: &str) -> Option<DateTime<Utc>> {
    match NaiveDateTime::parse_from_str(date_str, "%Y%m%dT%H%M%SZ") {
        Ok(naive) if date_str.len() == 16 => Some(naive.and_utc()),
        _ => {
            warn!("Invalid X-Amz-Date format: {}", date_str);
            None
        }
    }
}
