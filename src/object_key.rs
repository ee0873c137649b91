//! Object Key Module
//!
//! Derives the object-store key from an inbound request path.

use crate::{ProxyError, Result};
use std::fmt;

/// Non-empty key identifying an object in the store
///
/// The key keeps the on-the-wire form of the request path (percent-encoding
/// included); canonical encoding for signing happens in the signer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Strip the leading path separator from `path`
    ///
    /// `/images/foo.png` becomes `images/foo.png`. A bare root request (or an
    /// empty path) fails with [`ProxyError::EmptyKey`].
    pub fn from_path(path: &str) -> Result<Self> {
        let key = path.strip_prefix('/').unwrap_or(path);
        if key.is_empty() {
            return Err(ProxyError::EmptyKey);
        }
        Ok(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased extension of the last path segment, if any
    pub fn extension(&self) -> Option<String> {
        let file_name = self.0.rsplit('/').next().unwrap_or(&self.0);
        let (stem, ext) = file_name.rsplit_once('.')?;
        // Dotfiles like ".hidden" have no extension
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
