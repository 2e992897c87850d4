//! Media probing: demux a file, pull keyframes at chosen positions and turn
//! them into content-addressed WEBP thumbnails.

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod position;
pub mod tags;
pub mod thumbnail;

use sha2::{Digest, Sha512};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ProbeError;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegDecoder;
pub use thumbnail::{test_pattern, THUMBNAIL_HEIGHT};

/// Coarse kind of a demuxed file, stored as the `mediatype` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
    Image,
    None,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Image => "image",
            MediaType::None => "none",
        }
    }
}

/// An encoded thumbnail and its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    /// `<sha512 hex>.webp`
    pub name: String,
    pub image: Vec<u8>,
}

impl Thumbnail {
    pub fn from_image(image: Vec<u8>) -> Self {
        Self {
            name: digest_name(&image),
            image,
        }
    }
}

/// Content address of thumbnail bytes.
pub fn digest_name(bytes: &[u8]) -> String {
    let digest = Sha512::digest(bytes);
    format!("{:x}.webp", digest)
}

/// Everything one probe call learned about a file.
#[derive(Debug)]
pub struct MediaInfo {
    pub media_type: MediaType,
    pub tags: BTreeMap<String, String>,
    pub thumbnails: Vec<Thumbnail>,
    /// False once a seek attempt failed or the container has no duration.
    pub can_seek: bool,
    /// Probe attempts made, successful or not.
    pub probes: u32,
    /// Per-position failures that produced no thumbnail.
    pub failures: Vec<ProbeError>,
}

/// A decoder the dispatcher's workers call. Implementations must release
/// every native resource before `probe` returns.
pub trait MediaDecoder: Send + Sync {
    /// Demux `path` and take one thumbnail per entry of `positions`, each a
    /// fraction of the duration. Seeking is only attempted when `want_seek`
    /// is set and the container allows it.
    fn probe(&self, path: &Path, positions: &[f64], want_seek: bool)
        -> Result<MediaInfo, ProbeError>;

    /// Thumbnail used when no frame could be extracted.
    fn fallback_test_pattern(&self) -> Result<Thumbnail, ProbeError> {
        test_pattern()
    }
}
