//! Tag rules shared by every decoder.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::Path;

use super::MediaType;

/// What a demuxed stream contributes to the media type decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    /// Text rendered by the tty demuxer, which reports itself as video.
    AnsiVideo,
    Audio,
    Other,
}

/// Video beats audio; a video without a positive duration is a still image.
pub fn classify(streams: &[StreamKind], duration_secs: f64) -> MediaType {
    let media_type = if streams.contains(&StreamKind::Video) {
        MediaType::Video
    } else if streams.contains(&StreamKind::Audio) {
        MediaType::Audio
    } else {
        MediaType::None
    };

    if media_type == MediaType::Video && duration_secs <= 0.0 {
        MediaType::Image
    } else {
        media_type
    }
}

/// `DD:HH:MM:SS`
pub fn format_duration(duration_secs: f64) -> String {
    let total = duration_secs.max(0.0) as u64;
    format!(
        "{:02}:{:02}:{:02}:{:02}",
        total / 86_400,
        (total / 3_600) % 24,
        (total / 60) % 60,
        total % 60
    )
}

/// Tags derived from the decoder's view of the file.
pub fn stream_tags(media_type: MediaType, duration_secs: f64) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert("mediatype".to_string(), media_type.as_str().to_string());
    if duration_secs > 0.0 {
        tags.insert("duration".to_string(), format_duration(duration_secs));
    }
    tags
}

/// Filesystem tags every media file carries. The size is zero-padded to 99
/// digits so text ordering matches numeric ordering.
pub fn disk_tags(path: &Path, metadata: &Metadata) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert("favourite".to_string(), "false".to_string());
    tags.insert("diskfilename".to_string(), path.to_string_lossy().to_string());
    tags.insert("diskfilesize".to_string(), format!("{:099}", metadata.len()));
    if let Ok(modified) = metadata.modified() {
        let modified: DateTime<Utc> = modified.into();
        tags.insert(
            "diskfiletime".to_string(),
            modified.format("%Y-%m-%dT%H:%M:%S").to_string(),
        );
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        use StreamKind::*;
        assert_eq!(classify(&[Audio, Video], 30.0), MediaType::Video);
        assert_eq!(classify(&[Video], 0.0), MediaType::Image);
        assert_eq!(classify(&[AnsiVideo, Audio], 10.0), MediaType::Audio);
        assert_eq!(classify(&[AnsiVideo], 10.0), MediaType::None);
        assert_eq!(classify(&[Other], 0.0), MediaType::None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30.0), "00:00:00:30");
        assert_eq!(format_duration(3_725.9), "00:01:02:05");
        assert_eq!(format_duration(2.0 * 86_400.0 + 3_600.0), "02:01:00:00");
    }

    #[test]
    fn test_stream_tags_skip_unknown_duration() {
        let tags = stream_tags(MediaType::Image, 0.0);
        assert_eq!(tags.get("mediatype").map(String::as_str), Some("image"));
        assert!(!tags.contains_key("duration"));
    }

    #[test]
    fn test_disk_tags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, vec![0u8; 1234]).unwrap();
        let tags = disk_tags(&path, &std::fs::metadata(&path).unwrap());

        let size = &tags["diskfilesize"];
        assert_eq!(size.len(), 99);
        assert!(size.ends_with("1234"));
        assert_eq!(tags["favourite"], "false");
        assert_eq!(tags["diskfilename"], path.to_string_lossy());
        assert_eq!(tags["diskfiletime"].len(), "2024-01-01T00:00:00".len());
    }
}
