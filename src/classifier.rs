//! Content Classifier Module
//!
//! Maps an inbound request to a [`MediaClass`]. Classification is a single
//! total function evaluated once per request: the administrative passthrough
//! prefix is checked first, then the object key is classified by the
//! deployment's configured [`ClassificationStrategy`].

use crate::object_key::ObjectKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Extensions treated as video containers by the extension strategy
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "avi", "mkv"];

/// Media class of a request, fixed once determined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaClass {
    Image,
    Mp4Video,
    OtherVideo,
    /// Transformation backend callback traffic, forwarded unchanged
    Passthrough,
}

impl MediaClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaClass::Image => "image",
            MediaClass::Mp4Video => "mp4-video",
            MediaClass::OtherVideo => "other-video",
            MediaClass::Passthrough => "passthrough",
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, MediaClass::Mp4Video | MediaClass::OtherVideo)
    }
}

impl fmt::Display for MediaClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a deployment decides whether a key is video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ClassificationStrategy {
    /// Match the key's extension against [`VIDEO_EXTENSIONS`]
    #[default]
    Extension,
    /// Resolve the key's MIME type and match `video/*` / `application/mp4`
    MimeLookup,
}

impl std::str::FromStr for ClassificationStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "extension" => Ok(ClassificationStrategy::Extension),
            "mime-lookup" | "mime" => Ok(ClassificationStrategy::MimeLookup),
            other => Err(format!("Unknown classification strategy: {}", other)),
        }
    }
}

/// Resolve a MIME type from a lowercased extension
pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    let mime = match ext {
        // Video
        "mp4" | "m4v" | "mp4v" | "mpg4" => "video/mp4",
        "webm" => "video/webm",
        "mov" | "qt" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "ogv" => "video/ogg",
        "mpeg" | "mpg" => "video/mpeg",
        "3gp" => "video/3gpp",
        "ts" => "video/mp2t",
        // Image
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "svg" => "image/svg+xml",
        "bmp" => "image/bmp",
        "ico" => "image/vnd.microsoft.icon",
        "tif" | "tiff" => "image/tiff",
        "heic" => "image/heic",
        // Audio
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "ogg" | "oga" => "audio/ogg",
        "flac" => "audio/flac",
        _ => return None,
    };
    Some(mime)
}

/// Resolve the MIME type of an object key from its extension (case-insensitive)
pub fn lookup_mime(key: &ObjectKey) -> Option<&'static str> {
    key.extension().as_deref().and_then(mime_for_extension)
}

fn is_mp4_mime(mime: &str) -> bool {
    mime == "video/mp4" || mime == "application/mp4"
}

/// Classifies requests into media classes
#[derive(Debug, Clone)]
pub struct ContentClassifier {
    strategy: ClassificationStrategy,
    passthrough_prefix: String,
}

impl ContentClassifier {
    pub fn new(strategy: ClassificationStrategy, passthrough_prefix: impl Into<String>) -> Self {
        Self {
            strategy,
            passthrough_prefix: passthrough_prefix.into(),
        }
    }

    pub fn strategy(&self) -> ClassificationStrategy {
        self.strategy
    }

    /// Whether the raw request path belongs to the transformation backend
    pub fn is_passthrough(&self, path: &str) -> bool {
        !self.passthrough_prefix.is_empty() && path.starts_with(&self.passthrough_prefix)
    }

    /// Classify an object key; never returns [`MediaClass::Passthrough`]
    pub fn classify(&self, key: &ObjectKey) -> MediaClass {
        match self.strategy {
            ClassificationStrategy::Extension => {
                let ext = match key.extension() {
                    Some(ext) => ext,
                    None => return MediaClass::Image,
                };
                if !VIDEO_EXTENSIONS.contains(&ext.as_str()) {
                    return MediaClass::Image;
                }
                match mime_for_extension(&ext) {
                    Some(mime) if is_mp4_mime(mime) => MediaClass::Mp4Video,
                    _ => MediaClass::OtherVideo,
                }
            }
            ClassificationStrategy::MimeLookup => match lookup_mime(key) {
                Some(mime) if is_mp4_mime(mime) => MediaClass::Mp4Video,
                Some(mime) if mime.starts_with("video/") => MediaClass::OtherVideo,
                _ => MediaClass::Image,
            },
        }
    }
}
