use crate::config::EngineConfig;
use crate::enforcement::{DedupEnforcer, Enforcer, LogEnforcer};
use crate::error::Result;
use crate::fetch::{HttpImageFetcher, ImageFetcher};
use crate::message::InboundMessage;
use crate::nsfw::{ChatNsfwClassifier, DisabledClassifier, NsfwClassifier};
use crate::pool::{ImageJob, ImageScanPool, ScanContext};
use crate::sink::VerdictSink;
use crate::state::{is_new_or_inactive, ActivityStore, CommunityStore, RateLimiter};
use crate::verdict::{ReasonCategory, Verdict, VerdictEvent};
use chrono::{DateTime, Duration, Utc};
use image::DynamicImage;
use sentinel_filters::{TextFilters, TextHit};
use sentinel_vision::{
    corpus, load_embedder, EmbeddingScanner, ImageEmbedder, ImageMatch, ImageScanner,
    PhashScanner,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

const FETCH_TIMEOUT_SECS: u64 = 30;

/// Result of the synchronous part of message analysis.
///
/// Image verdicts arrive later through the enforcer and the verdict channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageOutcome {
    pub verdict: Verdict,
    pub dispatched_images: usize,
}

impl MessageOutcome {
    fn text(verdict: Verdict) -> Self {
        Self {
            verdict,
            dispatched_images: 0,
        }
    }
}

pub struct EngineBuilder {
    config: EngineConfig,
    enforcer: Option<Arc<dyn Enforcer>>,
    fetcher: Option<Arc<dyn ImageFetcher>>,
    classifier: Option<Arc<dyn NsfwClassifier>>,
    embedder: Option<Arc<dyn ImageEmbedder>>,
    subscriber: Option<mpsc::Sender<VerdictEvent>>,
    persist_state: bool,
}

impl EngineBuilder {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            enforcer: None,
            fetcher: None,
            classifier: None,
            embedder: None,
            subscriber: None,
            persist_state: true,
        }
    }

    #[must_use]
    pub fn enforcer(mut self, enforcer: Arc<dyn Enforcer>) -> Self {
        self.enforcer = Some(enforcer);
        self
    }

    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    #[must_use]
    pub fn classifier(mut self, classifier: Arc<dyn NsfwClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    #[must_use]
    pub fn embedder(mut self, embedder: Arc<dyn ImageEmbedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Matched verdicts (text and image) are also sent here.
    #[must_use]
    pub fn verdicts(mut self, subscriber: mpsc::Sender<VerdictEvent>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    /// Keep activity and community state in memory only.
    #[must_use]
    pub fn ephemeral(mut self) -> Self {
        self.persist_state = false;
        self
    }

    /// Must be called inside a tokio runtime: the image pool is spawned here.
    pub async fn build(self) -> Result<ModerationEngine> {
        let config = self.config;
        config.validate()?;
        let timeout = config.timeout_duration()?;
        let activity_windows = ActivityWindows {
            inactive_after: config.inactive_after()?,
            new_member: config.new_member_window()?,
        };
        let filters = TextFilters::from_config(&config.filters)?;
        log::info!(
            "Loaded {} rules and {} phrase matchers",
            filters.rules().len(),
            filters.phrases().len()
        );

        let (activity, communities) = if self.persist_state {
            (
                ActivityStore::open(config.activity_path()).await,
                CommunityStore::open(config.community_path()).await,
            )
        } else {
            (ActivityStore::in_memory(), CommunityStore::in_memory())
        };
        let communities = Arc::new(communities);

        let scanners = build_scanners(&config, self.embedder);
        for scanner in &scanners {
            reload_scanner(scanner.as_ref(), &config.corpus_dir).await;
        }

        let fetcher: Arc<dyn ImageFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(
                HttpImageFetcher::new(
                    config.images.max_download_bytes,
                    std::time::Duration::from_secs(FETCH_TIMEOUT_SECS),
                )?
                .allow_local_files(config.images.allow_local_files),
            ),
        };
        let classifier: Arc<dyn NsfwClassifier> = match (self.classifier, &config.nsfw.api_key) {
            (Some(classifier), _) => classifier,
            (None, Some(key)) => Arc::new(ChatNsfwClassifier::new(&config.nsfw, key.clone())?),
            (None, None) => {
                log::info!("No NSFW API key configured; NSFW classification disabled");
                Arc::new(DisabledClassifier)
            }
        };
        let enforcer = self
            .enforcer
            .unwrap_or_else(|| Arc::new(LogEnforcer) as Arc<dyn Enforcer>);
        let enforcer: Arc<dyn Enforcer> = Arc::new(DedupEnforcer::new(enforcer));

        let sink = VerdictSink::new(
            enforcer,
            Arc::clone(&communities),
            timeout,
            self.subscriber,
        );
        let pool = ImageScanPool::start(
            ScanContext {
                scanners: scanners.clone(),
                fetcher,
                classifier,
                communities: Arc::clone(&communities),
                sink: sink.clone(),
                require_decoded_image: config.nsfw.require_decoded_image,
            },
            config.images.concurrency,
            config.images.queue_capacity,
        );

        Ok(ModerationEngine {
            rate: RateLimiter::new(
                std::time::Duration::from_secs(config.limits.rate_window_secs),
                config.limits.max_messages,
            ),
            config,
            filters,
            activity,
            activity_windows,
            communities,
            scanners,
            pool,
            sink,
        })
    }
}

fn build_scanners(
    config: &EngineConfig,
    embedder: Option<Arc<dyn ImageEmbedder>>,
) -> Vec<Arc<dyn ImageScanner>> {
    let mut scanners: Vec<Arc<dyn ImageScanner>> =
        vec![Arc::new(PhashScanner::new(config.images.hash_threshold))];
    let embedding = &config.images.embedding;
    if !embedding.enabled {
        return scanners;
    }
    let embedder = match embedder {
        Some(embedder) => Some(embedder),
        None => match load_embedder(embedding.mode, &embedding.model_path) {
            Ok(embedder) => Some(embedder),
            Err(err) => {
                log::warn!(
                    "Embedding scanner disabled, could not load {}: {err}",
                    embedding.model_path.display()
                );
                None
            }
        },
    };
    if let Some(embedder) = embedder {
        log::info!("Embedding backend: {}", embedder.id());
        scanners.push(Arc::new(EmbeddingScanner::with_threshold(
            embedder,
            embedding.similarity_threshold,
        )));
    }
    scanners
}

/// Rebuild one registry; failures keep the current registry.
async fn reload_scanner(scanner: &dyn ImageScanner, dir: &Path) -> Option<usize> {
    match scanner.reload(dir).await {
        Ok(count) => {
            log::info!("{}: {count} corpus images loaded", scanner.name());
            Some(count)
        }
        Err(err) => {
            log::warn!(
                "{}: corpus reload from {} failed, keeping {} records: {err}",
                scanner.name(),
                dir.display(),
                scanner.len()
            );
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ActivityWindows {
    inactive_after: Duration,
    new_member: Duration,
}

/// Owns every piece of moderation state; share it behind an `Arc`.
pub struct ModerationEngine {
    config: EngineConfig,
    filters: TextFilters,
    rate: RateLimiter,
    activity: ActivityStore,
    activity_windows: ActivityWindows,
    communities: Arc<CommunityStore>,
    scanners: Vec<Arc<dyn ImageScanner>>,
    pool: ImageScanPool,
    sink: VerdictSink,
}

impl ModerationEngine {
    #[must_use]
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn filters(&self) -> &TextFilters {
        &self.filters
    }

    #[must_use]
    pub fn activity(&self) -> &ActivityStore {
        &self.activity
    }

    #[must_use]
    pub fn communities(&self) -> &CommunityStore {
        &self.communities
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate
    }

    #[must_use]
    pub fn scanners(&self) -> &[Arc<dyn ImageScanner>] {
        &self.scanners
    }

    /// Run all checks on `message`. The author's activity is updated afterwards whatever the
    /// outcome; bot messages are ignored entirely.
    pub async fn analyze(&self, message: &InboundMessage) -> Result<MessageOutcome> {
        if message.author.bot {
            return Ok(MessageOutcome::text(Verdict::clean()));
        }
        let now = Utc::now();
        let outcome = self.evaluate(message, now).await;
        if let Err(err) = self.activity.touch(&message.author.id, now).await {
            log::warn!("Failed to persist activity: {err}");
        }
        outcome
    }

    async fn evaluate(
        &self,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<MessageOutcome> {
        if let Some(verdict) = self.text_verdict(message) {
            self.emit(message, verdict.clone()).await;
            return Ok(MessageOutcome::text(verdict));
        }

        let images: Vec<_> = message.image_attachments().cloned().collect();
        if images.is_empty() || !self.should_scan_images(message, images.len(), now) {
            return Ok(MessageOutcome::text(Verdict::clean()));
        }
        let reference = message.reference();
        let mut dispatched = 0;
        for attachment in images {
            self.pool
                .submit(ImageJob {
                    message: reference.clone(),
                    attachment,
                })
                .await?;
            dispatched += 1;
        }
        log::debug!(
            "Dispatched {dispatched} image scans for message {}",
            message.id
        );
        Ok(MessageOutcome {
            verdict: Verdict::clean(),
            dispatched_images: dispatched,
        })
    }

    /// Rules, phrases, mentions, then rate; first hit wins.
    fn text_verdict(&self, message: &InboundMessage) -> Option<Verdict> {
        if let Some(hit) = self.filters.check(&message.content) {
            return Some(text_hit_verdict(&hit));
        }
        let limits = &self.config.limits;
        if message.mentions > limits.max_mentions {
            return Some(Verdict::muted(
                ReasonCategory::MassMention,
                format!("{} users mentioned in one message", message.mentions),
            ));
        }
        if self.rate.check(&message.author.id) {
            return Some(Verdict::flagged(
                ReasonCategory::RateLimit,
                format!(
                    "More than {} messages in {} seconds",
                    limits.max_messages, limits.rate_window_secs
                ),
            ));
        }
        None
    }

    fn should_scan_images(
        &self,
        message: &InboundMessage,
        count: usize,
        now: DateTime<Utc>,
    ) -> bool {
        if count >= 2 {
            return true;
        }
        is_new_or_inactive(
            self.activity.last_seen(&message.author.id),
            message.member_joined_at,
            now,
            self.activity_windows.inactive_after,
            self.activity_windows.new_member,
        )
    }

    async fn emit(&self, message: &InboundMessage, verdict: Verdict) {
        self.sink
            .emit(VerdictEvent {
                message: message.reference(),
                verdict,
                attachment: None,
            })
            .await;
    }

    /// Compare a decoded image against every visual registry, in order.
    pub async fn scan_image(&self, image: DynamicImage) -> Result<Option<ImageMatch>> {
        let scanners = self.scanners.clone();
        let found = tokio::task::spawn_blocking(move || {
            scanners.iter().find_map(|scanner| scanner.compare(&image))
        })
        .await
        .map_err(sentinel_vision::VisionError::from)?;
        Ok(found)
    }

    /// Reload every registry from the corpus directory. Returns the scanners that succeeded.
    pub async fn reload_corpus(&self) -> Vec<(&'static str, usize)> {
        let mut loaded = Vec::with_capacity(self.scanners.len());
        for scanner in &self.scanners {
            if let Some(count) = reload_scanner(scanner.as_ref(), &self.config.corpus_dir).await {
                loaded.push((scanner.name(), count));
            }
        }
        loaded
    }

    /// Copy `source` into the corpus and reload.
    pub async fn register_scam_image(&self, source: &Path) -> Result<PathBuf> {
        let stored = corpus::register_image(&self.config.corpus_dir, source).await?;
        log::info!("Registered scam image {}", stored.display());
        self.reload_corpus().await;
        Ok(stored)
    }

    /// Stop accepting image jobs and wait for pending scans.
    pub async fn drain(&self) {
        self.pool.drain().await;
    }

    pub async fn set_log_channel(&self, community_id: &str, channel: Option<String>) -> Result<()> {
        self.communities.set_log_channel(community_id, channel).await?;
        Ok(())
    }

    pub async fn set_events_channel(
        &self,
        community_id: &str,
        channel: Option<String>,
    ) -> Result<()> {
        self.communities
            .set_events_channel(community_id, channel)
            .await?;
        Ok(())
    }

    pub async fn set_nsfw_detection(&self, community_id: &str, enabled: bool) -> Result<()> {
        self.communities
            .set_nsfw_detection(community_id, enabled)
            .await?;
        Ok(())
    }
}

fn text_hit_verdict(hit: &TextHit<'_>) -> Verdict {
    match hit {
        TextHit::Rule { rule, found } => {
            let mut detail = String::new();
            if let Some(label) = &rule.label {
                detail.push_str(label);
                detail.push('\n');
            }
            detail.push_str(&format!(
                "Match: `{}`\nPattern: `{}`",
                found.text,
                hit.pattern()
            ));
            log::debug!("Rule {:?} matched", rule.kind);
            if rule.mute {
                Verdict::muted(ReasonCategory::SpamFilter, detail)
            } else {
                Verdict::flagged(ReasonCategory::SpamFilter, detail)
            }
        }
        TextHit::Phrase { matcher, found } => Verdict::flagged(
            ReasonCategory::ScamPhrase,
            format!(
                "Match: `{}`\nPhrase: `{}`",
                found.text,
                matcher.phrase()
            ),
        ),
    }
}

