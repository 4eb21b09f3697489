//! Whole-file JSON snapshots written through a temp file and an atomic rename.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct SnapshotFile {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SnapshotFile {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file yields the default; unreadable or corrupt files are logged and also yield
    /// the default.
    pub async fn load_or_default<T>(&self) -> T
    where
        T: DeserializeOwned + Default,
    {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return T::default(),
            Err(err) => {
                log::warn!("Failed to read {}: {err}", self.path.display());
                return T::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => {
                log::warn!("Ignoring corrupt snapshot {}: {err}", self.path.display());
                T::default()
            }
        }
    }

    /// Serialize the value produced by `capture` and replace the file.
    ///
    /// `capture` runs while holding the write lock, so concurrent writers always leave the file
    /// at the most recent state.
    pub async fn save_with<T, F>(&self, capture: F) -> Result<()>
    where
        T: Serialize,
        F: FnOnce() -> T,
    {
        let _guard = self.write_lock.lock().await;
        let bytes = serde_json::to_vec_pretty(&capture())?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_and_corrupt_files_load_as_default() {
        let dir = TempDir::new().unwrap();
        let file = SnapshotFile::new(dir.path().join("state.json"));
        let value: BTreeMap<String, u32> = file.load_or_default().await;
        assert!(value.is_empty());

        std::fs::write(file.path(), b"{not json").unwrap();
        let value: BTreeMap<String, u32> = file.load_or_default().await;
        assert!(value.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips_and_leaves_no_tmp() {
        let dir = TempDir::new().unwrap();
        let file = SnapshotFile::new(dir.path().join("nested/state.json"));
        let value = BTreeMap::from([("a".to_string(), 1u32)]);
        file.save_with(|| value.clone()).await.unwrap();

        let loaded: BTreeMap<String, u32> = file.load_or_default().await;
        assert_eq!(loaded, value);
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }
}
