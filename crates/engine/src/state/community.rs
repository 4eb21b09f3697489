use crate::error::Result;
use crate::snapshot::SnapshotFile;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;

/// Per-community moderation settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityConfig {
    #[serde(default, rename = "log_channel_id", skip_serializing_if = "Option::is_none")]
    pub log_channel: Option<String>,
    #[serde(
        default,
        rename = "events_channel_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub events_channel: Option<String>,
    #[serde(default, rename = "nsfw_detection")]
    pub nsfw_detection: bool,
}

/// Community settings keyed by community id, persisted to `communities.json`.
///
/// Entries are created on first write; reads of unknown communities see the defaults.
#[derive(Debug, Default)]
pub struct CommunityStore {
    configs: RwLock<HashMap<String, CommunityConfig>>,
    file: Option<SnapshotFile>,
}

impl CommunityStore {
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let file = SnapshotFile::new(path);
        let loaded: BTreeMap<String, CommunityConfig> = file.load_or_default().await;
        Self {
            configs: RwLock::new(loaded.into_iter().collect()),
            file: Some(file),
        }
    }

    #[must_use]
    pub fn get(&self, community_id: &str) -> CommunityConfig {
        let read = |map: &HashMap<String, CommunityConfig>| {
            map.get(community_id).cloned().unwrap_or_default()
        };
        match self.configs.read() {
            Ok(guard) => read(&*guard),
            Err(poisoned) => read(&*poisoned.into_inner()),
        }
    }

    #[must_use]
    pub fn log_channel(&self, community_id: &str) -> Option<String> {
        self.get(community_id).log_channel
    }

    #[must_use]
    pub fn events_channel(&self, community_id: &str) -> Option<String> {
        self.get(community_id).events_channel
    }

    #[must_use]
    pub fn nsfw_enabled(&self, community_id: &str) -> bool {
        self.get(community_id).nsfw_detection
    }

    pub async fn set_log_channel(
        &self,
        community_id: &str,
        channel: Option<String>,
    ) -> Result<CommunityConfig> {
        self.update(community_id, |cfg| cfg.log_channel = channel)
            .await
    }

    pub async fn set_events_channel(
        &self,
        community_id: &str,
        channel: Option<String>,
    ) -> Result<CommunityConfig> {
        self.update(community_id, |cfg| cfg.events_channel = channel)
            .await
    }

    pub async fn set_nsfw_detection(
        &self,
        community_id: &str,
        enabled: bool,
    ) -> Result<CommunityConfig> {
        self.update(community_id, |cfg| cfg.nsfw_detection = enabled)
            .await
    }

    /// Apply `change` and persist the whole snapshot. On a write error the in-memory change
    /// stays and the error is returned.
    pub async fn update<F>(&self, community_id: &str, change: F) -> Result<CommunityConfig>
    where
        F: FnOnce(&mut CommunityConfig),
    {
        let updated = {
            let mut guard = match self.configs.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let entry = guard.entry(community_id.to_string()).or_default();
            change(entry);
            entry.clone()
        };
        if let Some(file) = &self.file {
            file.save_with(|| self.capture()).await?;
        }
        Ok(updated)
    }

    fn capture(&self) -> BTreeMap<String, CommunityConfig> {
        let copy = |map: &HashMap<String, CommunityConfig>| {
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        match self.configs.read() {
            Ok(guard) => copy(&*guard),
            Err(poisoned) => copy(&*poisoned.into_inner()),
        }
    }
}
