//! Reloads the visual registries when the corpus directory changes.

use crate::config::WatcherConfig;
use crate::error::{EngineError, Result};
use notify::event::EventKind;
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use sentinel_vision::corpus::is_image_path;
use sentinel_vision::ImageScanner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, mpsc};
use tokio::time;

const FS_EVENT_REASON: &str = "fs_event";
const NOTIFY_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ReloadUpdate {
    pub completed_at: SystemTime,
    pub reason: String,
    /// Scanner name and record count, for every scanner that reloaded
    pub loaded: Vec<(&'static str, usize)>,
    /// Scanners whose reload failed and kept their previous registry
    pub failed: usize,
}

enum WatcherCommand {
    Trigger { reason: String },
    Shutdown,
}

#[derive(Clone)]
pub struct CorpusWatcher {
    inner: Arc<CorpusWatcherInner>,
}

struct CorpusWatcherInner {
    command_tx: mpsc::Sender<WatcherCommand>,
    update_tx: broadcast::Sender<ReloadUpdate>,
    _watcher: std::sync::Mutex<RecommendedWatcher>,
}

impl CorpusWatcher {
    /// Watch `dir` (created if missing) and reload `scanners` after each debounced burst.
    pub fn start(
        scanners: Vec<Arc<dyn ImageScanner>>,
        dir: &Path,
        config: &WatcherConfig,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let (event_tx, event_rx) = mpsc::channel(1024);
        let (command_tx, command_rx) = mpsc::channel(16);
        let (update_tx, _) = broadcast::channel(32);

        let watcher = create_fs_watcher(dir, event_tx)?;
        spawn_reload_loop(
            scanners,
            dir.to_path_buf(),
            DebounceState::new(
                Duration::from_millis(config.debounce_ms),
                Duration::from_millis(config.max_batch_wait_ms),
            ),
            event_rx,
            command_rx,
            update_tx.clone(),
        );
        log::info!("Watching scam-image corpus at {}", dir.display());

        Ok(Self {
            inner: Arc::new(CorpusWatcherInner {
                command_tx,
                update_tx,
                _watcher: std::sync::Mutex::new(watcher),
            }),
        })
    }

    /// Reload now, without waiting for filesystem events.
    pub async fn trigger(&self, reason: impl Into<String>) -> Result<()> {
        self.inner
            .command_tx
            .send(WatcherCommand::Trigger {
                reason: reason.into(),
            })
            .await
            .map_err(|e| EngineError::Watcher(format!("failed to send trigger: {e}")))
    }

    #[must_use]
    pub fn subscribe_updates(&self) -> broadcast::Receiver<ReloadUpdate> {
        self.inner.update_tx.subscribe()
    }
}

impl Drop for CorpusWatcher {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            let _ = self.inner.command_tx.try_send(WatcherCommand::Shutdown);
        }
    }
}

fn create_fs_watcher(
    dir: &Path,
    sender: mpsc::Sender<notify::Result<Event>>,
) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = sender.blocking_send(res);
        },
        NotifyConfig::default().with_poll_interval(NOTIFY_POLL_INTERVAL),
    )
    .map_err(|e| EngineError::Watcher(format!("watcher init failed: {e}")))?;
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|e| EngineError::Watcher(format!("failed to watch {}: {e}", dir.display())))?;
    Ok(watcher)
}

/// Only changes to image files matter; access events and temp files are noise.
fn is_relevant(event: &Event) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event.paths.iter().any(|p| is_image_path(p))
}

fn spawn_reload_loop(
    scanners: Vec<Arc<dyn ImageScanner>>,
    dir: PathBuf,
    mut state: DebounceState,
    mut event_rx: mpsc::Receiver<notify::Result<Event>>,
    mut command_rx: mpsc::Receiver<WatcherCommand>,
    update_tx: broadcast::Sender<ReloadUpdate>,
) {
    tokio::spawn(async move {
        loop {
            let next_deadline = state.next_deadline();

            tokio::select! {
                Some(event) = event_rx.recv() => {
                    match event {
                        Ok(event) if is_relevant(&event) => {
                            state.record_event(event.paths.len(), FS_EVENT_REASON);
                        }
                        Ok(_) => {}
                        Err(err) => log::warn!("Corpus watcher error: {err}"),
                    }
                }
                Some(cmd) = command_rx.recv() => {
                    match cmd {
                        WatcherCommand::Trigger { reason } => state.force_run(reason),
                        WatcherCommand::Shutdown => break,
                    }
                }
                () = async {
                    if let Some(deadline) = next_deadline {
                        time::sleep_until(deadline).await;
                    }
                }, if state.should_run() && next_deadline.is_some() => {
                    let reason = state.take();
                    let update = reload_all(&scanners, &dir, reason).await;
                    let _ = update_tx.send(update);
                }
                else => break,
            }
        }
        log::debug!("Corpus watcher stopped");
    });
}

async fn reload_all(
    scanners: &[Arc<dyn ImageScanner>],
    dir: &Path,
    reason: String,
) -> ReloadUpdate {
    let started = Instant::now();
    let mut loaded = Vec::with_capacity(scanners.len());
    let mut failed = 0;
    for scanner in scanners {
        match scanner.reload(dir).await {
            Ok(count) => loaded.push((scanner.name(), count)),
            Err(err) => {
                failed += 1;
                log::warn!(
                    "{}: reload failed, keeping {} records: {err}",
                    scanner.name(),
                    scanner.len()
                );
            }
        }
    }
    log::info!(
        "Corpus reloaded ({reason}) in {} ms: {loaded:?}",
        started.elapsed().as_millis()
    );
    ReloadUpdate {
        completed_at: SystemTime::now(),
        reason,
        loaded,
        failed,
    }
}

struct DebounceState {
    debounce: Duration,
    max_batch: Duration,
    dirty: bool,
    pending: usize,
    last_event: Option<Instant>,
    first_event: Option<Instant>,
    reason: Option<String>,
    force_immediate: bool,
}

impl DebounceState {
    const fn new(debounce: Duration, max_batch: Duration) -> Self {
        Self {
            debounce,
            max_batch,
            dirty: false,
            pending: 0,
            last_event: None,
            first_event: None,
            reason: None,
            force_immediate: false,
        }
    }

    fn record_event(&mut self, count: usize, reason: &str) {
        self.record_event_at(count, reason, Instant::now());
    }

    fn record_event_at(&mut self, count: usize, reason: &str, now: Instant) {
        self.pending += count.max(1);
        self.reason = Some(reason.to_string());
        self.last_event = Some(now);
        self.first_event.get_or_insert(now);
        self.dirty = true;
    }

    fn force_run(&mut self, reason: String) {
        self.pending += 1;
        self.reason = Some(reason);
        self.force_immediate = true;
        self.dirty = true;
    }

    const fn should_run(&self) -> bool {
        self.dirty
    }

    fn deadline(&self) -> Option<Instant> {
        if !self.dirty {
            return None;
        }
        if self.force_immediate {
            return Some(Instant::now());
        }
        let quiet = self.last_event.map(|last| last + self.debounce);
        let forced = self.first_event.map(|first| first + self.max_batch);
        match (quiet, forced) {
            (Some(q), Some(f)) => Some(q.min(f)),
            (q, f) => q.or(f),
        }
    }

    fn next_deadline(&self) -> Option<time::Instant> {
        self.deadline().map(time::Instant::from_std)
    }

    /// Reset for the next batch and return its reason.
    fn take(&mut self) -> String {
        let reason = self
            .reason
            .take()
            .unwrap_or_else(|| FS_EVENT_REASON.to_string());
        log::debug!("Reloading corpus after {} pending events", self.pending);
        *self = Self::new(self.debounce, self.max_batch);
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use pretty_assertions::assert_eq;
    use sentinel_vision::PhashScanner;
    use tempfile::TempDir;

    fn sample(dir: &Path, name: &str) {
        DynamicImage::ImageRgb8(RgbImage::from_fn(64, 64, |x, y| {
            Rgb([(x * 4) as u8, (y * 4) as u8, 90])
        }))
        .save_with_format(dir.join(name), ImageFormat::Png)
        .unwrap();
    }

    #[test]
    fn debounce_waits_for_quiet_but_caps_batches() {
        let debounce = Duration::from_millis(100);
        let max_batch = Duration::from_millis(300);
        let mut state = DebounceState::new(debounce, max_batch);
        assert!(!state.should_run());
        assert_eq!(state.deadline(), None);

        let t0 = Instant::now();
        state.record_event_at(1, "fs_event", t0);
        assert_eq!(state.deadline(), Some(t0 + debounce));

        let t1 = t0 + Duration::from_millis(250);
        state.record_event_at(2, "fs_event", t1);
        assert_eq!(state.deadline(), Some(t0 + max_batch));

        assert_eq!(state.take(), "fs_event");
        assert!(!state.should_run());
        assert_eq!(state.pending, 0);
    }

    #[test]
    fn forced_run_is_immediate() {
        let mut state = DebounceState::new(Duration::from_secs(10), Duration::from_secs(10));
        state.force_run("manual".to_string());
        let deadline = state.deadline().unwrap();
        assert!(deadline <= Instant::now());
        assert_eq!(state.take(), "manual");
    }

    #[test]
    fn only_image_changes_are_relevant() {
        let create = EventKind::Create(notify::event::CreateKind::File);
        let png = Event::new(create).add_path(PathBuf::from("/c/scam_1.png"));
        let tmp = Event::new(create).add_path(PathBuf::from("/c/scam_1.png.tmp"));
        let read = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/c/scam_1.png"));
        assert!(is_relevant(&png));
        assert!(!is_relevant(&tmp));
        assert!(!is_relevant(&read));
    }

    #[tokio::test]
    async fn trigger_reloads_every_scanner() {
        let dir = TempDir::new().unwrap();
        sample(dir.path(), "a.png");
        let scanner = Arc::new(PhashScanner::default());
        let watcher = CorpusWatcher::start(
            vec![scanner.clone() as Arc<dyn ImageScanner>],
            dir.path(),
            &WatcherConfig::default(),
        )
        .unwrap();
        let mut updates = watcher.subscribe_updates();
        watcher.trigger("manual").await.unwrap();

        let update = time::timeout(Duration::from_secs(10), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.reason, "manual");
        assert_eq!(update.loaded, vec![("phash", 1)]);
        assert_eq!(update.failed, 0);
        assert_eq!(scanner.len(), 1);
    }

    #[tokio::test]
    async fn new_corpus_file_triggers_reload() {
        let dir = TempDir::new().unwrap();
        let scanner = Arc::new(PhashScanner::default());
        let config = WatcherConfig {
            debounce_ms: 50,
            max_batch_wait_ms: 200,
        };
        let scanners = vec![scanner.clone() as Arc<dyn ImageScanner>];
        let watcher = CorpusWatcher::start(scanners, dir.path(), &config).unwrap();
        let mut updates = watcher.subscribe_updates();

        sample(dir.path(), "scam_1.png");
        let update = time::timeout(Duration::from_secs(15), async {
            loop {
                let update = updates.recv().await.unwrap();
                if update.loaded == vec![("phash", 1)] {
                    return update;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(update.reason, FS_EVENT_REASON);
        assert_eq!(scanner.len(), 1);
    }
}
