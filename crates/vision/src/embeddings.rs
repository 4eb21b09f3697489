//! Image embedding backends.
//!
//! `fast` runs an ONNX image classifier through `ort` and uses its 1000 logits as the embedding.
//! `stub` derives a deterministic vector from the preprocessed pixels so tests and CI never need
//! the model file.

use crate::error::{Result, VisionError};
use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use ort::execution_providers::CPUExecutionProvider;
use ort::session::{builder::GraphOptimizationLevel, Session, SessionInputs};
use ort::value::{DynTensor, Tensor};
use ort::Error as OrtError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const EMBEDDING_DIMENSION: usize = 1000;
pub const INPUT_SIDE: u32 = 224;

const CHANNEL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const CHANNEL_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub const EMBEDDING_MODE_ENV: &str = "SENTINEL_EMBEDDING_MODE";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingMode {
    #[default]
    Fast,
    Stub,
}

impl EmbeddingMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "stub" => Ok(Self::Stub),
            other => Err(VisionError::EmbeddingError(format!(
                "Unsupported {EMBEDDING_MODE_ENV} '{other}' (expected 'fast' or 'stub')"
            ))),
        }
    }

    /// Mode from the environment, `None` when unset.
    pub fn from_env() -> Result<Option<Self>> {
        match env::var(EMBEDDING_MODE_ENV) {
            Ok(raw) => Self::parse(&raw).map(Some),
            Err(_) => Ok(None),
        }
    }

    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Stub => "stub",
        }
    }
}

/// `image -> fixed-length vector`. Implementations are blocking and thread-safe.
pub trait ImageEmbedder: Send + Sync {
    fn id(&self) -> &'static str;

    fn dimension(&self) -> usize {
        EMBEDDING_DIMENSION
    }

    /// Unit-normalized embedding of `image`.
    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>>;
}

/// Build the embedder for `mode`. `model_path` is only read in `fast` mode.
pub fn load_embedder(mode: EmbeddingMode, model_path: &Path) -> Result<Arc<dyn ImageEmbedder>> {
    match mode {
        EmbeddingMode::Stub => Ok(Arc::new(StubImageEmbedder)),
        EmbeddingMode::Fast => Ok(Arc::new(OrtImageEmbedder::new(model_path)?)),
    }
}

/// Resize to 224x224 and lay out as normalized NCHW `f32`.
#[must_use]
pub fn preprocess(image: &DynamicImage) -> Array4<f32> {
    let side = INPUT_SIDE as usize;
    let rgb = image
        .resize_exact(INPUT_SIDE, INPUT_SIDE, FilterType::CatmullRom)
        .to_rgb8();
    let mut input = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            let v = f32::from(pixel[c]) / 255.0;
            input[[0, c, y as usize, x as usize]] = (v - CHANNEL_MEAN[c]) / CHANNEL_STD[c];
        }
    }
    input
}

pub fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return;
    }
    for value in vec {
        *value /= norm;
    }
}

/// Cosine similarity of two L2-normalized vectors, i.e. their dot product.
/// Vectors of different lengths score 0.0.
#[must_use]
pub fn unit_cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

const fn ensure_dimension(vec: &[f32], expected: usize) -> Result<()> {
    if vec.len() != expected {
        return Err(VisionError::InvalidDimension {
            expected,
            actual: vec.len(),
        });
    }
    Ok(())
}

/// Deterministic embedder: the preprocessed tensor average-pooled into 1000 bins.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubImageEmbedder;

impl ImageEmbedder for StubImageEmbedder {
    fn id(&self) -> &'static str {
        EmbeddingMode::Stub.id()
    }

    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let input = preprocess(image);
        let total = input.len();
        let mut sums = vec![0.0f32; EMBEDDING_DIMENSION];
        let mut counts = vec![0u32; EMBEDDING_DIMENSION];
        for (idx, value) in input.iter().enumerate() {
            let bin = idx * EMBEDDING_DIMENSION / total;
            sums[bin] += value;
            counts[bin] += 1;
        }
        let mut vec: Vec<f32> = sums
            .iter()
            .zip(counts.iter())
            .map(|(sum, &count)| if count == 0 { 0.0 } else { sum / count as f32 })
            .collect();
        normalize(&mut vec);
        Ok(vec)
    }
}

/// ONNX classifier with a `[1, 3, 224, 224]` input and a `[1, 1000]` output.
pub struct OrtImageEmbedder {
    session: Mutex<Session>,
    input_name: String,
    model_path: PathBuf,
}

impl OrtImageEmbedder {
    pub fn new(model_path: &Path) -> Result<Self> {
        if !model_path.exists() {
            return Err(VisionError::EmbeddingError(format!(
                "Embedding model is missing at {}. Set SENTINEL_MODEL_PATH or use {EMBEDDING_MODE_ENV}=stub.",
                model_path.display()
            )));
        }

        let session_builder =
            Session::builder().map_err(|e| VisionError::EmbeddingError(format!("{e}")))?;
        let session = session_builder
            .with_intra_threads(default_intra_threads())
            .map_err(|e| {
                VisionError::EmbeddingError(format!("Failed to set ORT intra threads: {e}"))
            })?
            .with_execution_providers([CPUExecutionProvider::default().build()])
            .map_err(|e| {
                VisionError::EmbeddingError(format!(
                    "Failed to register CPU execution provider: {e}"
                ))
            })?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| {
                VisionError::EmbeddingError(format!("Failed to set optimization level: {e}"))
            })?
            .commit_from_file(model_path)
            .map_err(|e| VisionError::EmbeddingError(format!("Failed to load ONNX model: {e}")))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| VisionError::EmbeddingError("ONNX model has no inputs".to_string()))?;

        log::info!(
            "Loaded image embedding model {} (input '{input_name}')",
            model_path.display()
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            model_path: model_path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}

impl ImageEmbedder for OrtImageEmbedder {
    fn id(&self) -> &'static str {
        EmbeddingMode::Fast.id()
    }

    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let input = preprocess(image);
        let tensor: DynTensor = Tensor::from_array(input.into_dyn())
            .map_err(|e| to_embedding_error(&e))?
            .upcast();

        let array = {
            let mut session = self.session.lock().map_err(|_| {
                VisionError::EmbeddingError("Failed to lock ONNX session".into())
            })?;

            let mut feed: HashMap<String, DynTensor> = HashMap::new();
            feed.insert(self.input_name.clone(), tensor);

            let outputs = session.run(SessionInputs::from(feed)).map_err(|e| {
                VisionError::EmbeddingError(format!("ONNX forward failed: {e}"))
            })?;

            if outputs.len() == 0 {
                return Err(VisionError::EmbeddingError(
                    "ONNX returned no outputs".to_string(),
                ));
            }

            let array = outputs[0]
                .try_extract_array::<f32>()
                .map_err(|e| {
                    VisionError::EmbeddingError(format!("Failed to decode ONNX output: {e}"))
                })?
                .to_owned();

            drop(outputs);
            drop(session);

            array
        };

        let mut vec: Vec<f32> = array.iter().copied().collect();
        ensure_dimension(&vec, EMBEDDING_DIMENSION)?;
        normalize(&mut vec);
        Ok(vec)
    }
}

fn default_intra_threads() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    // Inference shares the box with the image pool workers.
    (cpus / 2).clamp(1, 4)
}

fn to_embedding_error(error: &OrtError) -> VisionError {
    VisionError::EmbeddingError(format!("{error}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use pretty_assertions::assert_eq;

    fn solid(color: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb(color)))
    }

    #[test]
    fn unit_cosine_bounds() {
        let x = [1.0, 0.0, 0.0];
        assert!((unit_cosine(&x, &x) - 1.0).abs() < 1e-6);
        assert_eq!(unit_cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(unit_cosine(&x, &[1.0, 0.0]), 0.0);

        let mut a = vec![2.0, 1.0];
        let mut b = vec![4.0, 2.0];
        normalize(&mut a);
        normalize(&mut b);
        assert!((unit_cosine(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_yields_unit_length() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert_eq!(v, vec![0.6, 0.8]);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn preprocess_produces_nchw_normalized_planes() {
        let input = preprocess(&solid([255, 0, 0]));
        assert_eq!(input.shape(), &[1, 3, 224, 224]);
        let red = (1.0 - CHANNEL_MEAN[0]) / CHANNEL_STD[0];
        let green = (0.0 - CHANNEL_MEAN[1]) / CHANNEL_STD[1];
        assert!((input[[0, 0, 10, 10]] - red).abs() < 1e-5);
        assert!((input[[0, 1, 200, 3]] - green).abs() < 1e-5);
    }

    #[test]
    fn stub_embedder_is_deterministic_and_normalized() {
        let embedder = StubImageEmbedder;
        let a = embedder.embed(&solid([255, 0, 0])).unwrap();
        let b = embedder.embed(&solid([255, 0, 0])).unwrap();
        assert_eq!(a.len(), EMBEDDING_DIMENSION);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);

        let other = embedder.embed(&solid([0, 0, 255])).unwrap();
        assert!(unit_cosine(&a, &other) < 0.95);
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(EmbeddingMode::parse("STUB").unwrap(), EmbeddingMode::Stub);
        assert_eq!(EmbeddingMode::parse(" fast ").unwrap(), EmbeddingMode::Fast);
        assert!(EmbeddingMode::parse("gpu").is_err());
    }

    #[test]
    fn fast_mode_without_model_is_an_error() {
        let err = load_embedder(EmbeddingMode::Fast, Path::new("/nonexistent/model.onnx"));
        assert!(matches!(err, Err(VisionError::EmbeddingError(_))));
    }

    #[test]
    #[ignore = "Requires an ONNX image model at SENTINEL_MODEL_PATH"]
    fn onnx_embedding_has_expected_dimension() {
        let path = env::var("SENTINEL_MODEL_PATH").unwrap();
        let embedder = OrtImageEmbedder::new(Path::new(&path)).unwrap();
        let vec = embedder.embed(&solid([10, 200, 30])).unwrap();
        assert_eq!(vec.len(), EMBEDDING_DIMENSION);
    }
}
