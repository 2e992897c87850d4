//! FFmpeg-backed decoder.
//!
//! Every native object (format context, codec context, scaler, frames and
//! packets) is an owned `ffmpeg-next` wrapper local to one function, so it
//! is released on every return path, including `?` early exits.

use ffmpeg_next as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::util::frame::video::Video;
use image::RgbImage;
use std::collections::BTreeMap;
use std::path::Path;

use super::position::{attempt_position, Attempt};
use super::tags::{classify, stream_tags, StreamKind};
use super::thumbnail::{encode_webp, scaled_size};
use super::{MediaDecoder, MediaInfo, MediaType, Thumbnail};
use crate::error::ProbeError;

const WEBP_ENCODER: &str = "libwebp";

pub struct FfmpegDecoder {
    /// Whether FFmpeg was built with libwebp. Without it thumbnails are
    /// encoded as lossless RGB WEBP by the `image` crate.
    yuv420_webp: bool,
}

impl FfmpegDecoder {
    pub fn new() -> Result<Self, ProbeError> {
        ffmpeg::init()?;
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);

        let yuv420_webp = ffmpeg::encoder::find_by_name(WEBP_ENCODER).is_some();
        if !yuv420_webp {
            tracing::warn!("FFmpeg has no {} encoder, thumbnails will be lossless", WEBP_ENCODER);
        }
        Ok(Self { yuv420_webp })
    }

    /// Scale a decoded frame to thumbnail size and encode it as WEBP.
    fn encode(&self, frame: &Video) -> Result<Vec<u8>, ProbeError> {
        if self.yuv420_webp {
            encode_yuv420_webp(frame)
        } else {
            encode_webp(rgb_image(&scale(frame, Pixel::RGB24)?)?)
        }
    }
}

impl MediaDecoder for FfmpegDecoder {
    fn probe(
        &self,
        path: &Path,
        positions: &[f64],
        want_seek: bool,
    ) -> Result<MediaInfo, ProbeError> {
        match std::fs::metadata(path) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ProbeError::Missing),
            Err(e) => return Err(e.into()),
        }

        let (media_type, tags, duration_secs) = {
            let input = open_input(path)?;
            let duration_secs = duration_secs(&input);
            let streams: Vec<StreamKind> = input.streams().map(|s| stream_kind(&s)).collect();
            let media_type = classify(&streams, duration_secs);

            let mut tags: BTreeMap<String, String> = input
                .metadata()
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.to_string()))
                .collect();
            tags.extend(stream_tags(media_type, duration_secs));
            (media_type, tags, duration_secs)
        };

        if media_type == MediaType::None {
            return Err(ProbeError::NotMedia);
        }

        let mut can_seek = duration_secs > 0.0;
        let mut thumbnails = Vec::with_capacity(positions.len());
        let mut failures = Vec::new();

        for &position in positions {
            let attempt = attempt_position(position, want_seek, &mut can_seek, |at| {
                let frame = extract_keyframe(path, at)?;
                self.encode(&frame)
            });

            match attempt {
                Attempt::Frame(bytes) => thumbnails.push(Thumbnail::from_image(bytes)),
                Attempt::Fallback => {
                    tracing::debug!(path = %path.display(), position, "Using test pattern");
                    thumbnails.push(self.fallback_test_pattern()?);
                }
                Attempt::Failed(e) => {
                    tracing::warn!(path = %path.display(), position, error = %e, "Probe failed");
                    failures.push(e);
                }
            }
        }

        Ok(MediaInfo {
            media_type,
            tags,
            thumbnails,
            can_seek,
            probes: positions.len() as u32,
            failures,
        })
    }
}

fn open_input(path: &Path) -> Result<ffmpeg::format::context::Input, ProbeError> {
    match ffmpeg::format::input(&path) {
        Ok(input) => Ok(input),
        Err(ffmpeg::Error::InvalidData) => Err(ProbeError::NotMedia),
        Err(e) => Err(e.into()),
    }
}

fn duration_secs(input: &ffmpeg::format::context::Input) -> f64 {
    let duration = input.duration();
    if duration <= 0 {
        return 0.0;
    }
    duration as f64 / ffmpeg::ffi::AV_TIME_BASE as f64
}

fn stream_kind(stream: &ffmpeg::format::stream::Stream) -> StreamKind {
    let parameters = stream.parameters();
    match parameters.medium() {
        ffmpeg::media::Type::Video if parameters.id() == ffmpeg::codec::Id::ANSI => {
            StreamKind::AnsiVideo
        }
        ffmpeg::media::Type::Video => StreamKind::Video,
        ffmpeg::media::Type::Audio => StreamKind::Audio,
        _ => StreamKind::Other,
    }
}

/// Decode the first I-frame at or after `position` (a fraction of the
/// duration), or from the start when `position` is `None`.
fn extract_keyframe(path: &Path, position: Option<f64>) -> Result<Video, ProbeError> {
    let mut input = open_input(path)?;

    let (stream_index, parameters) = {
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or(ProbeError::NoVideoStream)?;
        (stream.index(), stream.parameters())
    };

    let context = ffmpeg::codec::context::Context::from_parameters(parameters)?;
    let mut decoder = context.decoder().video()?;

    if let Some(position) = position {
        let target = (input.duration() as f64 * position.clamp(0.0, 1.0)) as i64;
        input
            .seek(target, ..target)
            .map_err(|_| ProbeError::SeekUnsupported)?;
    }

    let mut decoded = Video::empty();

    for (stream, packet) in input.packets() {
        if stream.index() != stream_index {
            continue;
        }

        decoder
            .send_packet(&packet)
            .map_err(|e| ProbeError::Decode(e.to_string()))?;

        if receive_keyframe(&mut decoder, &mut decoded)? {
            return Ok(decoded);
        }
    }

    decoder
        .send_eof()
        .map_err(|e| ProbeError::Decode(e.to_string()))?;
    if receive_keyframe(&mut decoder, &mut decoded)? {
        Ok(decoded)
    } else {
        Err(ProbeError::EndOfFile)
    }
}

/// Pull frames until an I-frame lands in `decoded` (true) or the decoder
/// wants more input (false).
fn receive_keyframe(decoder: &mut ffmpeg::decoder::Video, decoded: &mut Video) -> Result<bool, ProbeError> {
    loop {
        match decoder.receive_frame(decoded) {
            Ok(()) => {
                if decoded.kind() == ffmpeg::util::picture::Type::I || decoded.is_key() {
                    return Ok(true);
                }
            }
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                return Ok(false)
            }
            Err(ffmpeg::Error::Eof) => return Ok(false),
            Err(e) => return Err(ProbeError::Decode(e.to_string())),
        }
    }
}

/// Scale to the thumbnail height in `format`.
fn scale(frame: &Video, format: Pixel) -> Result<Video, ProbeError> {
    let (width, height) = scaled_size(frame.width(), frame.height());

    let mut scaler = ffmpeg::software::scaling::context::Context::get(
        frame.format(),
        frame.width(),
        frame.height(),
        format,
        width,
        height,
        ffmpeg::software::scaling::flag::Flags::BICUBIC,
    )?;

    let mut scaled = Video::empty();
    scaler.run(frame, &mut scaled)?;
    Ok(scaled)
}

/// Repack an RGB24 frame's rows without line padding.
fn rgb_image(rgb: &Video) -> Result<RgbImage, ProbeError> {
    let (width, height) = (rgb.width(), rgb.height());
    let stride = rgb.stride(0);
    let row_bytes = width as usize * 3;
    let data = rgb.data(0);
    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(&data[start..start + row_bytes]);
    }

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| ProbeError::Encode("scaled frame has unexpected size".to_string()))
}

fn encode_error(e: ffmpeg::Error) -> ProbeError {
    ProbeError::Encode(e.to_string())
}

/// Lossy WEBP from a YUV420 frame through FFmpeg's libwebp encoder. The
/// single packet it emits is a complete RIFF WEBP file.
fn encode_yuv420_webp(frame: &Video) -> Result<Vec<u8>, ProbeError> {
    let codec = ffmpeg::encoder::find_by_name(WEBP_ENCODER)
        .ok_or_else(|| ProbeError::Encode(format!("{} encoder not available", WEBP_ENCODER)))?;

    let mut yuv = scale(frame, Pixel::YUV420P)?;
    yuv.set_pts(Some(0));

    let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
        .encoder()
        .video()
        .map_err(encode_error)?;
    encoder.set_width(yuv.width());
    encoder.set_height(yuv.height());
    encoder.set_format(Pixel::YUV420P);
    encoder.set_time_base((1, 1));
    let mut encoder = encoder.open_as(codec).map_err(encode_error)?;

    encoder.send_frame(&yuv).map_err(encode_error)?;
    encoder.send_eof().map_err(encode_error)?;

    let mut packet = ffmpeg::Packet::empty();
    let mut bytes = Vec::new();
    loop {
        match encoder.receive_packet(&mut packet) {
            Ok(()) => bytes.extend_from_slice(packet.data().unwrap_or_default()),
            Err(ffmpeg::Error::Eof) => break,
            Err(e) => return Err(encode_error(e)),
        }
    }

    if bytes.is_empty() {
        return Err(ProbeError::Encode("WEBP encoder produced no data".to_string()));
    }
    Ok(bytes)
}
