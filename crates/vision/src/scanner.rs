use crate::error::Result;
use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A corpus image that a query image was found to resemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMatch {
    /// Scanner that produced the match (`"phash"`, `"embedding"`)
    pub scanner: String,
    /// Corpus record name (file name)
    pub record: String,
    /// Human-readable distances or similarity
    pub detail: String,
    #[serde(skip)]
    pub evidence: Option<Vec<u8>>,
}

/// Strategy comparing an image against a registry of known scam images.
///
/// `compare` is CPU-bound and must be called from a blocking context.
#[async_trait]
pub trait ImageScanner: Send + Sync {
    fn name(&self) -> &'static str;

    fn compare(&self, image: &DynamicImage) -> Option<ImageMatch>;

    /// Rebuild the registry from `dir` and swap it in. On error the current registry stays.
    async fn reload(&self, dir: &Path) -> Result<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
