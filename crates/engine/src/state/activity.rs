use crate::error::Result;
use crate::snapshot::SnapshotFile;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;

/// New or inactive: never seen, last seen longer ago than `inactive_after`, or joined the
/// community less than `new_member` ago.
#[must_use]
pub fn is_new_or_inactive(
    last_seen: Option<DateTime<Utc>>,
    joined_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    inactive_after: Duration,
    new_member: Duration,
) -> bool {
    let Some(last_seen) = last_seen else {
        return true;
    };
    if now - last_seen > inactive_after {
        return true;
    }
    joined_at.is_some_and(|joined| now - joined < new_member)
}

/// Last-seen timestamp per user, persisted to `activity.json`.
#[derive(Debug, Default)]
pub struct ActivityStore {
    seen: RwLock<HashMap<String, DateTime<Utc>>>,
    file: Option<SnapshotFile>,
}

impl ActivityStore {
    /// Not persisted; for tests and one-shot tools.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let file = SnapshotFile::new(path);
        let loaded: BTreeMap<String, DateTime<Utc>> = file.load_or_default().await;
        log::debug!(
            "Loaded {} activity entries from {}",
            loaded.len(),
            file.path().display()
        );
        Self {
            seen: RwLock::new(loaded.into_iter().collect()),
            file: Some(file),
        }
    }

    #[must_use]
    pub fn last_seen(&self, user_id: &str) -> Option<DateTime<Utc>> {
        match self.seen.read() {
            Ok(guard) => guard.get(user_id).copied(),
            Err(poisoned) => poisoned.into_inner().get(user_id).copied(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.read().map(|g| g.len()).unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record activity and persist. A failed write is returned; memory is already updated.
    pub async fn touch(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.record(user_id, at);
        self.persist().await
    }

    fn record(&self, user_id: &str, at: DateTime<Utc>) {
        let mut guard = match self.seen.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.insert(user_id.to_string(), at);
    }

    fn capture(&self) -> BTreeMap<String, DateTime<Utc>> {
        match self.seen.read() {
            Ok(guard) => guard.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    async fn persist(&self) -> Result<()> {
        match &self.file {
            Some(file) => file.save_with(|| self.capture()).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn week() -> Duration {
        Duration::days(7)
    }

    #[test]
    fn new_or_inactive_policy() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        assert!(is_new_or_inactive(None, None, now, week(), week()));

        let yesterday = now - Duration::days(1);
        assert!(!is_new_or_inactive(Some(yesterday), None, now, week(), week()));

        let long_ago = now - Duration::days(8);
        assert!(is_new_or_inactive(Some(long_ago), None, now, week(), week()));

        let joined_recently = now - Duration::days(2);
        assert!(is_new_or_inactive(
            Some(yesterday),
            Some(joined_recently),
            now,
            week(),
            week()
        ));

        let joined_long_ago = now - Duration::days(30);
        assert!(!is_new_or_inactive(
            Some(yesterday),
            Some(joined_long_ago),
            now,
            week(),
            week()
        ));
    }

    #[tokio::test]
    async fn activity_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("activity.json");
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();

        let store = ActivityStore::open(&path).await;
        assert!(store.is_empty());
        store.touch("u1", at).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("2025-01-02T03:04:05Z"), "{raw}");

        let reopened = ActivityStore::open(&path).await;
        assert_eq!(reopened.last_seen("u1"), Some(at));
        assert_eq!(reopened.len(), 1);
    }

    #[tokio::test]
    async fn in_memory_store_never_writes() {
        let store = ActivityStore::in_memory();
        store.touch("u", Utc::now()).await.unwrap();
        assert!(store.last_seen("u").is_some());
    }
}
