//! Evidence crops attached to moderation reports.

use crate::error::Result;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;

/// JPEG quality for scam-image evidence.
pub const SCAM_EVIDENCE_QUALITY: u8 = 75;
/// JPEG quality for NSFW evidence.
pub const NSFW_EVIDENCE_QUALITY: u8 = 60;

const CROP_RATIO: f64 = 0.65;
const MIN_CROP_SIDE: u32 = 100;

/// Side of the centered square crop: 65% of the shorter side, or the whole shorter side when that
/// would drop below 100 px.
#[must_use]
pub fn crop_side(width: u32, height: u32) -> u32 {
    let short = width.min(height);
    let side = (f64::from(short) * CROP_RATIO).floor() as u32;
    if side < MIN_CROP_SIDE {
        short
    } else {
        side
    }
}

#[must_use]
pub fn center_crop(image: &DynamicImage) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    let side = crop_side(width, height);
    let x = (width - side) / 2;
    let y = (height - side) / 2;
    image.crop_imm(x, y, side, side)
}

pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality);
    encoder.encode_image(&rgb)?;
    Ok(bytes)
}

/// Centered crop encoded as JPEG. Encoding failures drop the evidence, not the verdict.
#[must_use]
pub fn evidence_jpeg(image: &DynamicImage, quality: u8) -> Option<Vec<u8>> {
    if image.width() == 0 || image.height() == 0 {
        return None;
    }
    match encode_jpeg(&center_crop(image), quality) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            log::warn!("Failed to encode evidence crop: {err}");
            None
        }
    }
}
