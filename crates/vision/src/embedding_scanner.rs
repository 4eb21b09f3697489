use crate::corpus::{decode_file, list_images, record_name};
use crate::embeddings::{normalize, unit_cosine, ImageEmbedder};
use crate::error::Result;
use crate::evidence::{evidence_jpeg, SCAM_EVIDENCE_QUALITY};
use crate::scanner::{ImageMatch, ImageScanner};
use async_trait::async_trait;
use image::DynamicImage;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Similarity strictly above which an image counts as a known scam image.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.95;

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub name: String,
    pub vector: Vec<f32>,
}

/// Learned-embedding scanner. Compares against every record and keeps the best.
pub struct EmbeddingScanner {
    embedder: Arc<dyn ImageEmbedder>,
    registry: RwLock<Arc<Vec<EmbeddingRecord>>>,
    threshold: f32,
}

impl EmbeddingScanner {
    #[must_use]
    pub fn new(embedder: Arc<dyn ImageEmbedder>) -> Self {
        Self::with_threshold(embedder, DEFAULT_SIMILARITY_THRESHOLD)
    }

    #[must_use]
    pub fn with_threshold(embedder: Arc<dyn ImageEmbedder>, threshold: f32) -> Self {
        Self {
            embedder,
            registry: RwLock::new(Arc::new(Vec::new())),
            threshold,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<EmbeddingRecord>> {
        match self.registry.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, records: Vec<EmbeddingRecord>) {
        let records = Arc::new(records);
        match self.registry.write() {
            Ok(mut guard) => *guard = records,
            Err(poisoned) => *poisoned.into_inner() = records,
        }
    }

    /// Embed and register one in-memory image.
    pub fn record_for(&self, name: &str, image: &DynamicImage) -> Result<EmbeddingRecord> {
        let mut vector = self.embedder.embed(image)?;
        normalize(&mut vector);
        Ok(EmbeddingRecord {
            name: name.to_string(),
            vector,
        })
    }

    /// Best `(record, similarity)` over the registry, regardless of threshold.
    #[must_use]
    pub fn best_match(&self, query: &[f32]) -> Option<(EmbeddingRecord, f32)> {
        let registry = self.snapshot();
        registry
            .iter()
            .map(|record| (record, unit_cosine(query, &record.vector)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(record, score)| (record.clone(), score))
    }
}

#[async_trait]
impl ImageScanner for EmbeddingScanner {
    fn name(&self) -> &'static str {
        "embedding"
    }

    fn compare(&self, image: &DynamicImage) -> Option<ImageMatch> {
        let mut query = match self.embedder.embed(image) {
            Ok(vector) => vector,
            Err(err) => {
                log::warn!("Embedding failed, skipping scan: {err}");
                return None;
            }
        };
        normalize(&mut query);

        let (record, score) = self.best_match(&query)?;
        if score <= self.threshold {
            log::debug!("Best embedding similarity {score:.4} ({})", record.name);
            return None;
        }
        Some(ImageMatch {
            scanner: self.name().to_string(),
            record: record.name,
            detail: format!("cosine similarity {score:.4}"),
            evidence: evidence_jpeg(image, SCAM_EVIDENCE_QUALITY),
        })
    }

    async fn reload(&self, dir: &Path) -> Result<usize> {
        let paths = list_images(dir)?;
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let permits = Arc::new(Semaphore::new(workers));

        let mut tasks = JoinSet::new();
        for (idx, path) in paths.into_iter().enumerate() {
            let embedder = self.embedder.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                let name = record_name(&path);
                let result = tokio::task::spawn_blocking(move || {
                    let image = decode_file(&path)?;
                    embedder.embed(&image)
                })
                .await;
                match result {
                    Ok(Ok(mut vector)) => {
                        normalize(&mut vector);
                        Some((idx, EmbeddingRecord { name, vector }))
                    }
                    Ok(Err(err)) => {
                        log::warn!("Skipping corpus image {name}: {err}");
                        None
                    }
                    Err(err) => {
                        log::warn!("Embedding task for {name} failed: {err}");
                        None
                    }
                }
            });
        }

        let mut indexed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Some(entry) = joined? {
                indexed.push(entry);
            }
        }
        indexed.sort_by_key(|(idx, _)| *idx);
        let records: Vec<EmbeddingRecord> = indexed.into_iter().map(|(_, r)| r).collect();

        let count = records.len();
        self.replace(records);
        log::info!("Loaded {count} embedding records ({})", self.embedder.id());
        Ok(count)
    }

    fn len(&self) -> usize {
        self.snapshot().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::StubImageEmbedder;
    use crate::error::VisionError;
    use image::{ImageFormat, Rgb, RgbImage};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    /// Embeds an image as its top-left pixel's channels, so tests control the geometry.
    struct PixelEmbedder;

    impl ImageEmbedder for PixelEmbedder {
        fn id(&self) -> &'static str {
            "pixel"
        }

        fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>> {
            if image.width() == 0 {
                return Err(VisionError::EmbeddingError("empty".into()));
            }
            let px = image.to_rgb8().get_pixel(0, 0).0;
            Ok(px.iter().map(|&c| f32::from(c)).collect())
        }
    }

    fn solid(color: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 200, Rgb(color)))
    }

    #[test]
    fn identical_vector_matches_orthogonal_does_not() {
        let scanner = EmbeddingScanner::new(Arc::new(PixelEmbedder));
        let record = scanner.record_for("red.png", &solid([255, 0, 0])).unwrap();
        scanner.replace(vec![record]);

        let found = scanner.compare(&solid([255, 0, 0])).expect("same vector");
        assert_eq!(found.scanner, "embedding");
        assert_eq!(found.record, "red.png");
        assert!(found.evidence.is_some());

        assert!(scanner.compare(&solid([0, 255, 0])).is_none());
    }

    #[test]
    fn best_record_wins_over_first() {
        let scanner = EmbeddingScanner::new(Arc::new(PixelEmbedder));
        scanner.replace(vec![
            scanner.record_for("close.png", &solid([250, 20, 0])).unwrap(),
            scanner.record_for("exact.png", &solid([255, 0, 0])).unwrap(),
        ]);
        let found = scanner.compare(&solid([255, 0, 0])).unwrap();
        assert_eq!(found.record, "exact.png");
    }

    #[test]
    fn threshold_is_strict() {
        let scanner = EmbeddingScanner::with_threshold(Arc::new(PixelEmbedder), 1.5);
        scanner.replace(vec![scanner.record_for("a", &solid([1, 2, 3])).unwrap()]);
        assert!(scanner.compare(&solid([1, 2, 3])).is_none());
    }

    #[tokio::test]
    async fn reload_embeds_corpus_in_order_and_keeps_registry_on_error() {
        let dir = TempDir::new().unwrap();
        for (name, color) in [("b.png", [0, 0, 255]), ("a.png", [255, 0, 0])] {
            solid(color)
                .save_with_format(dir.path().join(name), ImageFormat::Png)
                .unwrap();
        }
        std::fs::write(dir.path().join("c.png"), b"garbage").unwrap();

        let scanner = EmbeddingScanner::new(Arc::new(StubImageEmbedder));
        assert_eq!(scanner.reload(dir.path()).await.unwrap(), 2);
        let names: Vec<String> = scanner.snapshot().iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["a.png".to_string(), "b.png".to_string()]);

        assert!(scanner.reload(&dir.path().join("gone")).await.is_err());
        assert_eq!(scanner.len(), 2);

        let found = scanner.compare(&solid([255, 0, 0])).unwrap();
        assert_eq!(found.record, "a.png");
    }
}
