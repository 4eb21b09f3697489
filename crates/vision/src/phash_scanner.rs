use crate::corpus::load_images;
use crate::error::{Result, VisionError};
use crate::evidence::{evidence_jpeg, SCAM_EVIDENCE_QUALITY};
use crate::hashes::{HashTriple, DEFAULT_MATCH_THRESHOLD};
use crate::scanner::{ImageMatch, ImageScanner};
use async_trait::async_trait;
use image::DynamicImage;
use std::path::Path;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRecord {
    pub name: String,
    pub hashes: HashTriple,
}

/// Perceptual-hash ensemble scanner. First matching record (registry order) wins.
pub struct PhashScanner {
    registry: RwLock<Arc<Vec<HashRecord>>>,
    threshold: u32,
}

impl Default for PhashScanner {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl PhashScanner {
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            registry: RwLock::new(Arc::new(Vec::new())),
            threshold,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<HashRecord>> {
        match self.registry.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, records: Vec<HashRecord>) {
        let records = Arc::new(records);
        match self.registry.write() {
            Ok(mut guard) => *guard = records,
            Err(poisoned) => *poisoned.into_inner() = records,
        }
    }

    /// Hash already-decoded images into records. Undecodable (degenerate) images are skipped.
    #[must_use]
    pub fn build_records(images: &[(String, DynamicImage)]) -> Vec<HashRecord> {
        images
            .iter()
            .filter_map(|(name, image)| match HashTriple::of(image) {
                Some(hashes) => Some(HashRecord {
                    name: name.clone(),
                    hashes,
                }),
                None => {
                    log::warn!("Skipping corpus image {name}: cannot hash");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl ImageScanner for PhashScanner {
    fn name(&self) -> &'static str {
        "phash"
    }

    fn compare(&self, image: &DynamicImage) -> Option<ImageMatch> {
        let query = HashTriple::of(image)?;
        let registry = self.snapshot();
        let (record, distances) = registry.iter().find_map(|record| {
            let distances = query.distances(&record.hashes);
            distances
                .is_match(self.threshold)
                .then_some((record, distances))
        })?;

        log::debug!(
            "phash match against {}: p={} d={} a={}",
            record.name,
            distances.perceptual,
            distances.difference,
            distances.average
        );
        Some(ImageMatch {
            scanner: self.name().to_string(),
            record: record.name.clone(),
            detail: format!(
                "pHash {} / dHash {} / aHash {} (mean {})",
                distances.perceptual,
                distances.difference,
                distances.average,
                distances.mean()
            ),
            evidence: evidence_jpeg(image, SCAM_EVIDENCE_QUALITY),
        })
    }

    async fn reload(&self, dir: &Path) -> Result<usize> {
        let dir = dir.to_path_buf();
        let records = tokio::task::spawn_blocking(move || {
            let images = load_images(&dir)?;
            Ok::<_, VisionError>(Self::build_records(&images))
        })
        .await??;

        let count = records.len();
        self.replace(records);
        log::info!("Loaded {count} perceptual-hash records");
        Ok(count)
    }

    fn len(&self) -> usize {
        self.snapshot().len()
    }
}
