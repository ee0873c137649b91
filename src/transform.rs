//! Transformation Policy Module
//!
//! Chooses how the transformation backend should re-encode an object: output
//! image format and quality (negotiated from `Accept`), or a fixed video
//! transcode profile. Directives are a closed enum per media class so an image
//! can never carry a video width and vice versa.

use crate::classifier::MediaClass;
use crate::config::TransformConfig;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Output image formats offered through negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Avif,
    Webp,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Avif => "avif",
            ImageFormat::Webp => "webp",
        }
    }

    fn media_type(&self) -> &'static str {
        match self {
            ImageFormat::Avif => "image/avif",
            ImageFormat::Webp => "image/webp",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the image backend may reuse the origin auth headers it receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OriginAuth {
    #[default]
    SharePublicly,
    /// Headers are stripped by the backend; only useful for public origins
    Strip,
}

impl OriginAuth {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginAuth::SharePublicly => "share-publicly",
            OriginAuth::Strip => "strip",
        }
    }
}

/// Resize behaviour for video output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum VideoFit {
    #[default]
    Contain,
    Cover,
    ScaleDown,
}

impl VideoFit {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoFit::Contain => "contain",
            VideoFit::Cover => "cover",
            VideoFit::ScaleDown => "scale-down",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDirective {
    /// `None` keeps the original encoding
    pub format: Option<ImageFormat>,
    pub quality: u8,
    pub origin_auth: OriginAuth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoDirective {
    pub width: u32,
    pub fit: VideoFit,
}

impl VideoDirective {
    pub const MODE: &'static str = "video";
    pub const CONTAINER: &'static str = "mp4";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformationDirective {
    Image(ImageDirective),
    Video(VideoDirective),
    /// Object is served exactly as stored
    None,
}

impl TransformationDirective {
    /// Comma-joined `key=value` options understood by the backend
    pub fn options(&self) -> Option<String> {
        match self {
            TransformationDirective::Image(image) => {
                let mut options = Vec::with_capacity(3);
                if let Some(format) = image.format {
                    options.push(format!("format={}", format));
                }
                options.push(format!("quality={}", image.quality));
                options.push(format!("origin-auth={}", image.origin_auth.as_str()));
                Some(options.join(","))
            }
            TransformationDirective::Video(video) => Some(format!(
                "mode={},width={},fit={},format={}",
                VideoDirective::MODE,
                video.width,
                video.fit.as_str(),
                VideoDirective::CONTAINER
            )),
            TransformationDirective::None => None,
        }
    }

    /// Label for the `x-media-transform` diagnostic header
    pub fn kind(&self) -> &'static str {
        match self {
            TransformationDirective::Image(_) => "image",
            TransformationDirective::Video(_) => "video",
            TransformationDirective::None => "none",
        }
    }
}

/// Whether `accept` lists `media_type` as a whole media range that is not refused
fn accepts(accept: &str, media_type: &str) -> bool {
    accept.split(',').any(|range| {
        let mut parts = range.split(';');
        let name = parts.next().unwrap_or("").trim();
        if !name.eq_ignore_ascii_case(media_type) {
            return false;
        }
        // q=0 means "not acceptable"
        !parts.any(|param| {
            let param = param.trim();
            match param.split_once('=') {
                Some((k, v)) if k.trim().eq_ignore_ascii_case("q") => {
                    v.trim().parse::<f32>().map(|q| q <= 0.0).unwrap_or(false)
                }
                _ => false,
            }
        })
    })
}

/// Pick the output image format from an `Accept` header; avif wins over webp
pub fn negotiate_image_format(accept: &str) -> Option<ImageFormat> {
    [ImageFormat::Avif, ImageFormat::Webp]
        .into_iter()
        .find(|format| accepts(accept, format.media_type()))
}

/// Build `<base>/<prefix>/<options>/<url-encoded source>`
pub fn build_transform_url(base_url: &str, prefix: &str, options: &str, source_url: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        base_url.trim_end_matches('/'),
        prefix.trim_matches('/'),
        options,
        utf8_percent_encode(source_url, NON_ALPHANUMERIC)
    )
}

/// Selects transformation directives from fixed configuration and the request
#[derive(Debug, Clone)]
pub struct TransformationPolicySelector {
    image_quality: u8,
    origin_auth: OriginAuth,
    video_width: u32,
    video_fit: VideoFit,
}

impl TransformationPolicySelector {
    pub fn new(config: &TransformConfig) -> Self {
        Self {
            image_quality: config.image_quality,
            origin_auth: config.origin_auth,
            video_width: config.video_width,
            video_fit: config.video_fit,
        }
    }

    pub fn select(&self, class: MediaClass, accept: Option<&str>) -> TransformationDirective {
        match class {
            MediaClass::Image => TransformationDirective::Image(ImageDirective {
                format: accept.and_then(negotiate_image_format),
                quality: self.image_quality,
                origin_auth: self.origin_auth,
            }),
            // Accept is not consulted; the backend does not negotiate video
            MediaClass::Mp4Video => TransformationDirective::Video(VideoDirective {
                width: self.video_width,
                fit: self.video_fit,
            }),
            MediaClass::OtherVideo | MediaClass::Passthrough => TransformationDirective::None,
        }
    }
}
