//! Error types shared across the ingestion pipeline.

use thiserror::Error;

/// Why a probe could not produce a thumbnail.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The container could not be demuxed; normal for text, subtitles and the like.
    #[error("not a media file")]
    NotMedia,

    /// The file disappeared between scan and probe.
    #[error("file vanished before it could be probed")]
    Missing,

    #[error("stream does not support seeking")]
    SeekUnsupported,

    #[error("end of file reached before a keyframe was decoded")]
    EndOfFile,

    #[error("no video stream")]
    NoVideoStream,

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(feature = "ffmpeg")]
    #[error(transparent)]
    Ffmpeg(#[from] ffmpeg_next::Error),
}

impl ProbeError {
    /// Failures that still leave the file recordable with a fallback thumbnail.
    pub fn wants_fallback(&self) -> bool {
        matches!(self, ProbeError::EndOfFile | ProbeError::NoVideoStream)
    }

    /// Failures of the host rather than the file. These stop the owning loop
    /// instead of being recorded against the file.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProbeError::Io(_) => true,
            #[cfg(feature = "ffmpeg")]
            ProbeError::Ffmpeg(_) => true,
            _ => false,
        }
    }
}

/// True when the error chain bottoms out in SQLite reporting a busy or
/// locked database.
pub fn is_storage_locked(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked
        )
    })
}
