//! Bounded image-scan pool.
//!
//! Jobs go through a bounded queue (submitters wait when it is full); a dispatcher task hands
//! them to workers limited by a semaphore. Matches are emitted through the verdict sink.

use crate::error::{EngineError, Result};
use crate::fetch::{fetch_image, ImageFetcher};
use crate::message::{Attachment, MessageRef};
use crate::nsfw::NsfwClassifier;
use crate::sink::VerdictSink;
use crate::state::CommunityStore;
use crate::verdict::{ReasonCategory, Verdict, VerdictEvent};
use image::DynamicImage;
use sentinel_vision::evidence::{evidence_jpeg, NSFW_EVIDENCE_QUALITY};
use sentinel_vision::{ImageMatch, ImageScanner};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

#[derive(Debug, Clone)]
pub struct ImageJob {
    pub message: MessageRef,
    pub attachment: Attachment,
}

/// Everything a worker needs; shared by all workers.
pub(crate) struct ScanContext {
    pub(crate) scanners: Vec<Arc<dyn ImageScanner>>,
    pub(crate) fetcher: Arc<dyn ImageFetcher>,
    pub(crate) classifier: Arc<dyn NsfwClassifier>,
    pub(crate) communities: Arc<CommunityStore>,
    pub(crate) sink: VerdictSink,
    pub(crate) require_decoded_image: bool,
}

pub struct ImageScanPool {
    jobs: Mutex<Option<mpsc::Sender<ImageJob>>>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ImageScanPool {
    pub(crate) fn start(context: ScanContext, concurrency: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let handle = tokio::spawn(dispatch(Arc::new(context), rx, concurrency.max(1)));
        Self {
            jobs: Mutex::new(Some(tx)),
            dispatcher: tokio::sync::Mutex::new(Some(handle)),
        }
    }

    /// Queue a job, waiting while the queue is full.
    pub async fn submit(&self, job: ImageJob) -> Result<()> {
        let sender = {
            let guard = match self.jobs.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.clone()
        };
        let Some(sender) = sender else {
            return Err(EngineError::Closed);
        };
        sender.send(job).await.map_err(|_| EngineError::Closed)
    }

    /// Stop accepting jobs and wait for queued and running ones to finish.
    pub async fn drain(&self) {
        if let Ok(mut guard) = self.jobs.lock() {
            guard.take();
        }
        let handle = self.dispatcher.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                log::warn!("Image dispatcher ended abnormally: {err}");
            }
        }
    }
}

async fn dispatch(context: Arc<ScanContext>, mut rx: mpsc::Receiver<ImageJob>, limit: usize) {
    let semaphore = Arc::new(Semaphore::new(limit));
    let mut workers = JoinSet::new();
    while let Some(job) = rx.recv().await {
        while let Some(done) = workers.try_join_next() {
            if let Err(err) = done {
                log::warn!("Image worker panicked: {err}");
            }
        }
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let context = Arc::clone(&context);
        workers.spawn(async move {
            let _permit = permit;
            scan_attachment(&context, job).await;
        });
    }
    while let Some(done) = workers.join_next().await {
        if let Err(err) = done {
            log::warn!("Image worker panicked: {err}");
        }
    }
    log::debug!("Image scan pool drained");
}

/// Visual scanners first; NSFW only when none matched and the community enabled it.
pub(crate) async fn scan_attachment(context: &ScanContext, job: ImageJob) -> Option<VerdictEvent> {
    let url = job.attachment.url.clone();
    let image = match fetch_image(context.fetcher.as_ref(), &url).await {
        Ok(image) => Some(Arc::new(image)),
        Err(err) => {
            log::warn!("Could not load attachment {url}: {err}");
            None
        }
    };

    if let Some(image) = &image {
        if let Some(found) = run_scanners(&context.scanners, Arc::clone(image)).await {
            let detail = format!(
                "Image matches known scam image `{}` ({}: {})",
                found.record, found.scanner, found.detail
            );
            let verdict =
                Verdict::muted(ReasonCategory::ScamImage, detail).with_evidence(found.evidence);
            return Some(emit(context, job, verdict).await);
        }
    }

    let nsfw_enabled = job
        .message
        .community_id
        .as_deref()
        .is_some_and(|id| context.communities.nsfw_enabled(id));
    if !nsfw_enabled {
        return None;
    }
    if image.is_none() && context.require_decoded_image {
        log::debug!("Skipping NSFW check for undecoded {url}");
        return None;
    }

    let answer = context
        .classifier
        .classify(&url, image.as_deref())
        .await;
    let verdict = match answer {
        Ok(Some(verdict)) if verdict.is_unsafe() => verdict,
        Ok(_) => return None,
        Err(err) => {
            log::warn!("NSFW classification failed: {err}");
            return None;
        }
    };

    let evidence = match image {
        Some(image) => tokio::task::spawn_blocking(move || {
            evidence_jpeg(&image, NSFW_EVIDENCE_QUALITY)
        })
        .await
        .unwrap_or_default(),
        None => None,
    };
    let detail = format!(
        "Image classified as not safe for this community (confidence {}%)",
        verdict.confidence
    );
    let verdict = Verdict::muted(ReasonCategory::Nsfw, detail).with_evidence(evidence);
    Some(emit(context, job, verdict).await)
}

async fn run_scanners(
    scanners: &[Arc<dyn ImageScanner>],
    image: Arc<DynamicImage>,
) -> Option<ImageMatch> {
    let scanners = scanners.to_vec();
    let result = tokio::task::spawn_blocking(move || {
        scanners.iter().find_map(|scanner| {
            let found = scanner.compare(&image);
            if found.is_none() {
                log::debug!("{}: no match", scanner.name());
            }
            found
        })
    })
    .await;
    match result {
        Ok(found) => found,
        Err(err) => {
            log::warn!("Image scanners failed: {err}");
            None
        }
    }
}

async fn emit(context: &ScanContext, job: ImageJob, verdict: Verdict) -> VerdictEvent {
    let event = VerdictEvent {
        message: job.message,
        verdict,
        attachment: Some(job.attachment.url),
    };
    context.sink.emit(event.clone()).await;
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcement::{EnforcementAction, RecordingEnforcer};
    use crate::nsfw::{NsfwLabel, NsfwVerdict};
    use async_trait::async_trait;
    use chrono::Duration;
    use image::{ImageFormat, Rgb, RgbImage};
    use pretty_assertions::assert_eq;
    use sentinel_vision::{HashRecord, HashTriple, PhashScanner};
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn checker(invert: bool) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(160, 160, |x, y| {
            let on = ((x / 20 + y / 20) % 2 == 0) ^ invert;
            if on {
                Rgb([240, 240, 240])
            } else {
                Rgb([15, 15, 15])
            }
        }))
    }

    fn png(image: &DynamicImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    struct MapFetcher(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl ImageFetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            self.0
                .get(url)
                .cloned()
                .ok_or_else(|| EngineError::Fetch(format!("404 {url}")))
        }
    }

    struct FixedClassifier {
        label: NsfwLabel,
        calls: AtomicUsize,
        unavailable: AtomicBool,
    }

    #[async_trait]
    impl NsfwClassifier for FixedClassifier {
        async fn classify(
            &self,
            _url: &str,
            _image: Option<&DynamicImage>,
        ) -> Result<Option<NsfwVerdict>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(EngineError::Classifier("no model answered".to_string()));
            }
            Ok(Some(NsfwVerdict {
                label: self.label,
                confidence: 90,
            }))
        }
    }

    struct Fixture {
        context: ScanContext,
        enforcer: Arc<RecordingEnforcer>,
        classifier: Arc<FixedClassifier>,
    }

    async fn fixture(label: NsfwLabel, nsfw: bool, require_decoded_image: bool) -> Fixture {
        let scanner = PhashScanner::default();
        let known = checker(false);
        scanner.replace(vec![HashRecord {
            name: "scam_1.png".to_string(),
            hashes: HashTriple::of(&known).unwrap(),
        }]);
        let fetcher = MapFetcher(HashMap::from([
            ("scam.png".to_string(), png(&checker(false))),
            ("other.png".to_string(), png(&checker(true))),
        ]));
        let communities = Arc::new(CommunityStore::in_memory());
        communities.set_nsfw_detection("g", nsfw).await.unwrap();
        communities
            .set_log_channel("g", Some("logs".to_string()))
            .await
            .unwrap();
        let enforcer = Arc::new(RecordingEnforcer::new());
        let classifier = Arc::new(FixedClassifier {
            label,
            calls: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        });
        let sink = VerdictSink::new(
            enforcer.clone(),
            Arc::clone(&communities),
            Duration::days(7),
            None,
        );
        Fixture {
            context: ScanContext {
                scanners: vec![Arc::new(scanner) as Arc<dyn ImageScanner>],
                fetcher: Arc::new(fetcher),
                classifier: classifier.clone(),
                communities,
                sink,
                require_decoded_image,
            },
            enforcer,
            classifier,
        }
    }

    fn job(url: &str) -> ImageJob {
        ImageJob {
            message: MessageRef {
                message_id: "m".to_string(),
                channel_id: "c".to_string(),
                community_id: Some("g".to_string()),
                author_id: "u".to_string(),
                author_name: None,
            },
            attachment: Attachment {
                url: url.to_string(),
                filename: None,
                content_type: Some("image/png".to_string()),
            },
        }
    }

    #[tokio::test]
    async fn scam_image_is_muted_with_evidence_and_skips_nsfw() {
        let f = fixture(NsfwLabel::Nsfw, true, false).await;
        let event = scan_attachment(&f.context, job("scam.png")).await.unwrap();
        assert_eq!(event.verdict.category(), Some(ReasonCategory::ScamImage));
        assert!(event.verdict.mute());
        assert!(event.verdict.evidence().is_some());
        assert_eq!(f.classifier.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.enforcer.actions().len(), 3);
    }

    #[tokio::test]
    async fn unmatched_image_goes_to_nsfw_when_enabled() {
        let f = fixture(NsfwLabel::Nsfw, true, false).await;
        let event = scan_attachment(&f.context, job("other.png")).await.unwrap();
        assert_eq!(event.verdict.category(), Some(ReasonCategory::Nsfw));
        assert!(event.verdict.mute());
        assert!(event.verdict.evidence().is_some());
    }

    #[tokio::test]
    async fn safe_or_disabled_nsfw_yields_nothing() {
        let f = fixture(NsfwLabel::Safe, true, false).await;
        assert!(scan_attachment(&f.context, job("other.png")).await.is_none());

        let f = fixture(NsfwLabel::Nsfw, false, false).await;
        assert!(scan_attachment(&f.context, job("other.png")).await.is_none());
        assert_eq!(f.classifier.calls.load(Ordering::SeqCst), 0);
        assert!(f.enforcer.actions().is_empty());
    }

    #[tokio::test]
    async fn failed_download_still_classifies_unless_required() {
        let f = fixture(NsfwLabel::Nsfw, true, false).await;
        let event = scan_attachment(&f.context, job("missing.png")).await.unwrap();
        assert_eq!(event.verdict.category(), Some(ReasonCategory::Nsfw));
        assert!(event.verdict.evidence().is_none());

        let f = fixture(NsfwLabel::Nsfw, true, true).await;
        assert!(scan_attachment(&f.context, job("missing.png")).await.is_none());
        assert_eq!(f.classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn classifier_failure_counts_as_safe_and_scanning_continues() {
        let f = fixture(NsfwLabel::Nsfw, true, false).await;
        f.classifier.unavailable.store(true, Ordering::SeqCst);
        assert!(scan_attachment(&f.context, job("other.png")).await.is_none());
        assert_eq!(f.classifier.calls.load(Ordering::SeqCst), 1);
        assert!(f.enforcer.actions().is_empty());

        let enforcer = Arc::clone(&f.enforcer);
        let pool = ImageScanPool::start(f.context, 1, 4);
        pool.submit(job("other.png")).await.unwrap();
        pool.submit(job("scam.png")).await.unwrap();
        pool.drain().await;
        assert_eq!(
            enforcer.actions(),
            vec![
                EnforcementAction::Delete {
                    message_id: "m".to_string()
                },
                EnforcementAction::Timeout {
                    user_id: "u".to_string()
                },
                EnforcementAction::Report {
                    channel: "logs".to_string(),
                    message_id: "m".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn pool_drains_submitted_jobs() {
        let f = fixture(NsfwLabel::Safe, false, false).await;
        let enforcer = Arc::clone(&f.enforcer);
        let pool = ImageScanPool::start(f.context, 2, 1);
        for _ in 0..3 {
            pool.submit(job("scam.png")).await.unwrap();
        }
        pool.drain().await;
        let deletes = enforcer
            .actions()
            .into_iter()
            .filter(|a| matches!(a, EnforcementAction::Delete { .. }))
            .count();
        assert_eq!(deletes, 3);
        assert!(matches!(
            pool.submit(job("scam.png")).await,
            Err(EngineError::Closed)
        ));
    }
}
