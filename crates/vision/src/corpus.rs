//! On-disk corpus of known scam images: one file per record.

use crate::error::{Result, VisionError};
use image::{DynamicImage, ImageReader, Limits};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

/// Largest width or height accepted when decoding.
pub const MAX_IMAGE_DIMENSION: u32 = 8192;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif", "bmp"];

#[must_use]
pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// Image files directly inside `dir`, sorted by file name.
///
/// An unreadable or missing directory is an error so callers can keep their current registry.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(VisionError::CorpusError(format!(
            "Corpus directory {} is not readable",
            dir.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            VisionError::CorpusError(format!("Failed to read {}: {e}", dir.display()))
        })?;
        if entry.file_type().is_file() && is_image_path(entry.path()) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn limits() -> Limits {
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_IMAGE_DIMENSION);
    limits.max_image_height = Some(MAX_IMAGE_DIMENSION);
    limits
}

pub fn decode_bytes(bytes: &[u8]) -> Result<DynamicImage> {
    let mut reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    reader.limits(limits());
    Ok(reader.decode()?)
}

pub fn decode_file(path: &Path) -> Result<DynamicImage> {
    let bytes = std::fs::read(path)?;
    decode_bytes(&bytes)
}

/// Decode every corpus image, skipping (and logging) files that fail to decode.
pub fn load_images(dir: &Path) -> Result<Vec<(String, DynamicImage)>> {
    let mut images = Vec::new();
    for path in list_images(dir)? {
        match decode_file(&path) {
            Ok(image) => images.push((record_name(&path), image)),
            Err(err) => log::warn!("Skipping corpus image {}: {err}", path.display()),
        }
    }
    Ok(images)
}

#[must_use]
pub fn record_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Copy `source` into the corpus as `scam_<unix-seconds>.<ext>`.
///
/// The source must decode as an image; nothing is written otherwise.
pub async fn register_image(dir: &Path, source: &Path) -> Result<PathBuf> {
    let bytes = tokio::fs::read(source).await?;
    decode_bytes(&bytes)?;

    let ext = source
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| IMAGE_EXTENSIONS.iter().any(|k| ext.eq_ignore_ascii_case(k)))
        .map_or_else(|| "png".to_string(), str::to_ascii_lowercase);
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    tokio::fs::create_dir_all(dir).await?;
    let mut target = dir.join(format!("scam_{secs}.{ext}"));
    let mut suffix = 1;
    while tokio::fs::try_exists(&target).await? {
        target = dir.join(format!("scam_{secs}_{suffix}.{ext}"));
        suffix += 1;
    }

    let tmp = target.with_extension(format!("{ext}.tmp"));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, &target).await?;
    log::info!("Registered scam image {}", target.display());
    Ok(target)
}
