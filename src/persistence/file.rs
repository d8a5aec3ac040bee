//! JSON file storage adapter
//!
//! Keeps entries in memory and rewrites the whole file on every mutation,
//! through a temporary file and a rename so a crash never leaves a torn file.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use super::adapter::{select_range, AdapterOp, EntryStream, RangeOptions, StorageAdapter};
use crate::error::{Error, Result};

/// Adapter persisting a base64-valued JSON map to a single file
pub struct JsonFileAdapter {
    path: PathBuf,
    entries: Mutex<Option<BTreeMap<String, String>>>,
}

impl JsonFileAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, String>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(BTreeMap::new());
        }

        let data = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Storage(format!("{}: {}", self.path.display(), e)))?;

        if data.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&data).map_err(|e| Error::Deserialization(e.to_string()))
    }

    async fn save(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");

        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| Error::Storage(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::Storage(format!("{}: {}", self.path.display(), e)))?;

        debug!("Saved {} entries to {}", entries.len(), self.path.display());
        Ok(())
    }

    /// Apply `mutate` to a copy of the entries and commit it only if the save succeeds
    async fn mutate<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let mut guard = self.entries.lock().await;
        let current = guard.as_ref().ok_or_else(closed)?;

        let mut next = current.clone();
        mutate(&mut next);
        self.save(&next).await?;

        *guard = Some(next);
        Ok(())
    }
}

fn closed() -> Error {
    Error::Storage("adapter is closed".to_string())
}

fn decode_value(key: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| Error::Deserialization(format!("{}: {}", key, e)))
}

#[async_trait]
impl StorageAdapter for JsonFileAdapter {
    async fn open(&self) -> Result<()> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            let entries = self.load().await?;
            debug!("Opened {} with {} entries", self.path.display(), entries.len());
            *guard = Some(entries);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.entries.lock().await.take();
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let guard = self.entries.lock().await;
        let entries = guard.as_ref().ok_or_else(closed)?;
        let value = entries
            .get(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        decode_value(key, value)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let encoded = STANDARD.encode(value);
        self.mutate(|entries| {
            entries.insert(key.to_string(), encoded);
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.mutate(|entries| {
            entries.remove(key);
        })
        .await
    }

    async fn batch(&self, ops: Vec<AdapterOp>) -> Result<()> {
        self.mutate(|entries| {
            for op in ops {
                match op {
                    AdapterOp::Put { key, value } => {
                        entries.insert(key, STANDARD.encode(value));
                    }
                    AdapterOp::Del { key } => {
                        entries.remove(&key);
                    }
                }
            }
        })
        .await
    }

    async fn stream(&self, options: RangeOptions) -> Result<EntryStream> {
        let guard = self.entries.lock().await;
        let entries = guard.as_ref().ok_or_else(closed)?;
        let selected = select_range(entries, &options);

        let decoded = selected
            .into_iter()
            .map(|(key, value)| decode_value(&key, &value).map(|bytes| (key, bytes)));
        Ok(stream::iter(decoded.collect::<Vec<_>>()).boxed())
    }
}
