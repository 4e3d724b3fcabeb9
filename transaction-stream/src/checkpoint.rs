// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::Mutex;

/// Key under which the next version to stream from is stored.
pub const STARTING_VERSION_KEY: &str = "startingVersion";

/// Trait for something that persists how far a consumer has streamed.
///
/// Writes for a given key are expected to come from a single consumer. Sharing one key
/// between concurrently running consumers is not supported and is not detected.
#[async_trait::async_trait]
pub trait CheckpointStore: 'static + Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<u64>>;

    /// Insert the value if the key is absent, overwrite it otherwise.
    async fn upsert(&self, key: &str, version: u64) -> Result<()>;
}

#[async_trait::async_trait]
impl<S: CheckpointStore + ?Sized> CheckpointStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<u64>> {
        (**self).get(key).await
    }

    async fn upsert(&self, key: &str, version: u64) -> Result<()> {
        (**self).upsert(key, version).await
    }
}

/// An in-memory, transient checkpoint store.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<BTreeMap<String, u64>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.checkpoints.lock().await.get(key).copied())
    }

    async fn upsert(&self, key: &str, version: u64) -> Result<()> {
        self.checkpoints
            .lock()
            .await
            .insert(key.to_string(), version);
        Ok(())
    }
}

/// Keeps checkpoints in a JSON file. Every upsert rewrites the file through a
/// temporary sibling and an atomic rename, so a crash leaves either the old or the
/// new contents on disk.
///
/// The write runs on the blocking pool and is not cancellable. If the future of an
/// upsert is dropped after the write started, the new value still lands. Callers that
/// are cancelled never start another upsert.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, u64>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).with_context(|| {
                format!(
                    "Failed to parse checkpoint file at {}",
                    self.path.to_string_lossy()
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e).with_context(|| {
                format!(
                    "Failed to read checkpoint file at {}",
                    self.path.to_string_lossy()
                )
            }),
        }
    }

    fn write_all(path: &Path, checkpoints: &BTreeMap<String, u64>) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.to_string_lossy()))?;
        serde_json::to_writer_pretty(&mut file, checkpoints)
            .context("Failed to serialize checkpoints")?;
        file.flush().context("Failed to flush checkpoint file")?;
        file.as_file()
            .sync_all()
            .context("Failed to sync checkpoint file")?;
        file.persist(path).with_context(|| {
            format!(
                "Failed to move checkpoint file into place at {}",
                path.to_string_lossy()
            )
        })?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let _lock = self.lock.lock().await;
        Ok(self.read_all().await?.get(key).copied())
    }

    async fn upsert(&self, key: &str, version: u64) -> Result<()> {
        let _lock = self.lock.lock().await;
        let mut checkpoints = self.read_all().await?;
        checkpoints.insert(key.to_string(), version);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::write_all(&path, &checkpoints))
            .await
            .context("Checkpoint writer task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_upsert() {
        let store = InMemoryCheckpointStore::new();
        assert_eq!(store.get(STARTING_VERSION_KEY).await.unwrap(), None);
        store.upsert(STARTING_VERSION_KEY, 100).await.unwrap();
        store.upsert(STARTING_VERSION_KEY, 105).await.unwrap();
        assert_eq!(store.get(STARTING_VERSION_KEY).await.unwrap(), Some(105));
        assert_eq!(store.get("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let store = FileCheckpointStore::new(&path);
        assert_eq!(store.get(STARTING_VERSION_KEY).await.unwrap(), None);
        store.upsert(STARTING_VERSION_KEY, 42).await.unwrap();
        store.upsert("other", 7).await.unwrap();
        store.upsert(STARTING_VERSION_KEY, 43).await.unwrap();
        drop(store);

        let reopened = FileCheckpointStore::new(&path);
        assert_eq!(reopened.get(STARTING_VERSION_KEY).await.unwrap(), Some(43));
        assert_eq!(reopened.get("other").await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        std::fs::write(&path, b"not json").unwrap();

        let store = FileCheckpointStore::new(&path);
        assert!(store.get(STARTING_VERSION_KEY).await.is_err());
        assert!(store.upsert(STARTING_VERSION_KEY, 1).await.is_err());
    }
}
