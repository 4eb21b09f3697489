//! # Sentinel Vision
//!
//! Visual similarity scanners that flag images resembling a corpus of known scam images.
//!
//! ```text
//! corpus dir ──> decode ──┬─> HashTriple (pHash/dHash/aHash) ──> PhashScanner
//!                         └─> ImageEmbedder (ONNX | stub) ───> EmbeddingScanner
//! ```
//!
//! Both scanners implement [`ImageScanner`]; registries are rebuilt off to the side and swapped
//! in whole, so a comparison always sees one consistent corpus.

pub mod corpus;
pub mod embedding_scanner;
pub mod embeddings;
mod error;
pub mod evidence;
pub mod hashes;
pub mod phash_scanner;
mod scanner;

pub use embedding_scanner::{EmbeddingRecord, EmbeddingScanner, DEFAULT_SIMILARITY_THRESHOLD};
pub use embeddings::{
    load_embedder, unit_cosine, EmbeddingMode, ImageEmbedder, OrtImageEmbedder, StubImageEmbedder,
    EMBEDDING_DIMENSION,
};
pub use error::{Result, VisionError};
pub use hashes::{HashDistances, HashTriple, DEFAULT_MATCH_THRESHOLD};
pub use phash_scanner::{HashRecord, PhashScanner};
pub use scanner::{ImageMatch, ImageScanner};
