//! Engine configuration: TOML file, then environment overrides, then validation.
//!
//! Every field has a default, so an empty (or absent) file yields a working engine.

use crate::error::{EngineError, Result};
use sentinel_filters::FilterConfig;
use sentinel_vision::{EmbeddingMode, DEFAULT_MATCH_THRESHOLD, DEFAULT_SIMILARITY_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_EMBEDDING_MODE: &str = "SENTINEL_EMBEDDING_MODE";
pub const ENV_MODEL_PATH: &str = "SENTINEL_MODEL_PATH";
pub const ENV_IMAGE_CONCURRENCY: &str = "SENTINEL_IMAGE_CONCURRENCY";
pub const ENV_NSFW_API_KEY: &str = "SENTINEL_NSFW_API_KEY";

const MAX_IMAGE_CONCURRENCY: usize = 32;

/// Upper bound for every day-valued setting.
pub const MAX_DAYS: i64 = 3_650;

pub const ACTIVITY_SNAPSHOT: &str = "activity.json";
pub const COMMUNITY_SNAPSHOT: &str = "communities.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the activity and community snapshots
    pub state_dir: PathBuf,
    /// Directory of known scam images
    pub corpus_dir: PathBuf,
    pub filters: FilterConfig,
    pub limits: LimitsConfig,
    pub images: ImageConfig,
    pub nsfw: NsfwConfig,
    pub enforcement: EnforcementConfig,
    pub watcher: WatcherConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("data"),
            corpus_dir: PathBuf::from("data/scam_images"),
            filters: FilterConfig::default(),
            limits: LimitsConfig::default(),
            images: ImageConfig::default(),
            nsfw: NsfwConfig::default(),
            enforcement: EnforcementConfig::default(),
            watcher: WatcherConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// More mentions than this in one message is a mass mention
    pub max_mentions: usize,
    /// More messages than this inside the window is spamming
    pub max_messages: usize,
    pub rate_window_secs: u64,
    pub inactive_after_days: i64,
    pub new_member_days: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_mentions: 5,
            max_messages: 5,
            rate_window_secs: 5,
            inactive_after_days: 7,
            new_member_days: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Concurrent image scans
    pub concurrency: usize,
    /// Pending image jobs before `analyze` waits
    pub queue_capacity: usize,
    pub hash_threshold: u32,
    pub max_download_bytes: u64,
    /// Read attachments that are `file://` URLs or bare paths from the local disk.
    /// Only for trusted input such as the CLI; off by default.
    pub allow_local_files: bool,
    pub embedding: EmbeddingConfig,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            concurrency: default_image_concurrency(),
            queue_capacity: 64,
            hash_threshold: DEFAULT_MATCH_THRESHOLD,
            max_download_bytes: 20 * 1024 * 1024,
            allow_local_files: false,
            embedding: EmbeddingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    pub mode: EmbeddingMode,
    pub model_path: PathBuf,
    pub similarity_threshold: f32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: EmbeddingMode::Fast,
            model_path: PathBuf::from("models/efficientnet_lite0.onnx"),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NsfwConfig {
    /// OpenAI-compatible chat completions endpoint
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Tried in order until one answers
    pub models: Vec<String>,
    /// Skip classification when the attachment could not be downloaded and decoded
    pub require_decoded_image: bool,
    pub timeout_secs: u64,
}

impl Default for NsfwConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            api_key: None,
            models: vec![
                "allenai/molmo-2-8b:free".to_string(),
                "google/gemma-3-27b-it:free".to_string(),
            ],
            require_decoded_image: false,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    pub timeout_days: i64,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self { timeout_days: 7 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub debounce_ms: u64,
    pub max_batch_wait_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 750,
            max_batch_wait_ms: 3_000,
        }
    }
}

fn default_image_concurrency() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus.clamp(1, 4)
}

fn parse_image_concurrency(raw: Option<&str>, default_value: usize) -> usize {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default_value)
        .clamp(1, MAX_IMAGE_CONCURRENCY)
}

fn check_days(name: &str, value: i64, min: i64) -> Result<()> {
    if (min..=MAX_DAYS).contains(&value) {
        Ok(())
    } else {
        Err(EngineError::Config(format!(
            "{name} must be between {min} and {MAX_DAYS}, got {value}"
        )))
    }
}

fn days(name: &str, value: i64) -> Result<chrono::Duration> {
    chrono::Duration::try_days(value)
        .ok_or_else(|| EngineError::Config(format!("{name} is out of range: {value}")))
}

impl EngineConfig {
    /// Load from `path` (or defaults), apply process environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_toml(&raw)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| EngineError::Config(format!("Invalid TOML: {e}")))
    }

    /// Apply `SENTINEL_*` overrides using `lookup` as the environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_EMBEDDING_MODE) {
            self.images.embedding.mode =
                EmbeddingMode::parse(&raw).map_err(|e| EngineError::Config(e.to_string()))?;
        }
        if let Some(path) = lookup(ENV_MODEL_PATH).filter(|v| !v.trim().is_empty()) {
            self.images.embedding.model_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup(ENV_IMAGE_CONCURRENCY) {
            self.images.concurrency = parse_image_concurrency(Some(&raw), self.images.concurrency);
        }
        if let Some(key) = lookup(ENV_NSFW_API_KEY).filter(|v| !v.trim().is_empty()) {
            self.nsfw.api_key = Some(key);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| -> Result<()> { Err(EngineError::Config(msg.to_string())) };
        if self.images.concurrency == 0 {
            return fail("images.concurrency must be at least 1");
        }
        if self.images.queue_capacity == 0 {
            return fail("images.queue_capacity must be at least 1");
        }
        let threshold = self.images.embedding.similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return fail("images.embedding.similarity_threshold must be in (0, 1]");
        }
        if self.images.hash_threshold > 64 {
            return fail("images.hash_threshold must be at most 64");
        }
        if self.limits.rate_window_secs == 0 {
            return fail("limits.rate_window_secs must be positive");
        }
        check_days("enforcement.timeout_days", self.enforcement.timeout_days, 1)?;
        check_days("limits.inactive_after_days", self.limits.inactive_after_days, 0)?;
        check_days("limits.new_member_days", self.limits.new_member_days, 0)?;
        Ok(())
    }

    /// How long a muted author is timed out.
    pub fn timeout_duration(&self) -> Result<chrono::Duration> {
        days("enforcement.timeout_days", self.enforcement.timeout_days)
    }

    /// No activity for longer than this makes a user inactive.
    pub fn inactive_after(&self) -> Result<chrono::Duration> {
        days("limits.inactive_after_days", self.limits.inactive_after_days)
    }

    /// Members who joined less than this ago are new.
    pub fn new_member_window(&self) -> Result<chrono::Duration> {
        days("limits.new_member_days", self.limits.new_member_days)
    }

    #[must_use]
    pub fn activity_path(&self) -> PathBuf {
        self.state_dir.join(ACTIVITY_SNAPSHOT)
    }

    #[must_use]
    pub fn community_path(&self) -> PathBuf {
        self.state_dir.join(COMMUNITY_SNAPSHOT)
    }
}
