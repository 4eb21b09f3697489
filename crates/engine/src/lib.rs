//! # Sentinel Engine
//!
//! Decision and rate engine for chat moderation. Per message, in order and stopping at the
//! first hit:
//!
//! 1. rule filters and fuzzy scam phrases (`sentinel-filters`)
//! 2. mass mentions
//! 3. per-user message rate
//! 4. image scans, dispatched to a bounded pool when the message carries several images or
//!    comes from a new or inactive user (`sentinel-vision`, then the NSFW classifier)
//!
//! Matched verdicts go to an [`Enforcer`] and, optionally, to a verdict channel.

pub mod config;
mod engine;
pub mod enforcement;
mod error;
pub mod fetch;
pub mod message;
pub mod nsfw;
mod pool;
mod sink;
pub mod snapshot;
pub mod state;
pub mod verdict;
pub mod watcher;

pub use config::EngineConfig;
pub use engine::{EngineBuilder, MessageOutcome, ModerationEngine};
pub use enforcement::{apply_verdict, DedupEnforcer, Enforcer, LogEnforcer};
pub use error::{EngineError, Result};
pub use fetch::{HttpImageFetcher, ImageFetcher};
pub use message::{Attachment, Author, InboundMessage, MessageRef};
pub use nsfw::{
    ChatNsfwClassifier, CompletionTransport, DisabledClassifier, HttpTransport, NsfwClassifier,
    NsfwLabel, NsfwVerdict,
};
pub use pool::{ImageJob, ImageScanPool};
pub use verdict::{ReasonCategory, Verdict, VerdictEvent};
pub use watcher::{CorpusWatcher, ReloadUpdate};
