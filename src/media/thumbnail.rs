use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

use super::Thumbnail;
use crate::error::ProbeError;

pub const THUMBNAIL_HEIGHT: u32 = 540;
const TEST_PATTERN_WIDTH: u32 = 960;

/// Output size for a source frame: fixed height, aspect-preserving width
/// rounded to an even number of pixels.
pub fn scaled_size(width: u32, height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (TEST_PATTERN_WIDTH, THUMBNAIL_HEIGHT);
    }
    let scaled = (width as f64 * THUMBNAIL_HEIGHT as f64 / height as f64).round() as u32;
    let even = (scaled + 1) & !1;
    (even.max(2), THUMBNAIL_HEIGHT)
}

pub fn encode_webp(frame: RgbImage) -> Result<Vec<u8>, ProbeError> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(frame)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::WebP)
        .map_err(|e| ProbeError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// 75% colour bars over a black plinth.
pub fn test_pattern() -> Result<Thumbnail, ProbeError> {
    const BARS: [[u8; 3]; 7] = [
        [191, 191, 191],
        [191, 191, 0],
        [0, 191, 191],
        [0, 191, 0],
        [191, 0, 191],
        [191, 0, 0],
        [0, 0, 191],
    ];

    let bars_height = THUMBNAIL_HEIGHT * 3 / 4;
    let image = RgbImage::from_fn(TEST_PATTERN_WIDTH, THUMBNAIL_HEIGHT, |x, y| {
        if y >= bars_height {
            return Rgb([16, 16, 16]);
        }
        let bar = (x * BARS.len() as u32 / TEST_PATTERN_WIDTH) as usize;
        Rgb(BARS[bar.min(BARS.len() - 1)])
    });

    Ok(Thumbnail::from_image(encode_webp(image)?))
}
