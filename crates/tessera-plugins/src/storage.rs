//! Persistence of installed plugins
//!
//! The registry writes one record per plugin through a [`PluginStorage`]
//! and reloads them on startup. Two backends are provided:
//!
//! - [`MemoryStorage`]: ephemeral, every process starts empty
//! - [`FileStorage`]: one JSON document per plugin plus a private data directory
//!
//! # File layout
//!
//! ```text
//! <root>/
//! ├── plugins/
//! │   └── <plugin-id>.json
//! └── data/
//!     └── <plugin-id>/
//! ```
//!
//! Records are written to a temporary file and renamed into place, so a crash
//! leaves either the old or the new record. Nothing coordinates several
//! processes sharing one root.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::manifest::PluginManifest;
use crate::registry::Plugin;
use crate::{PluginError, Result};

/// Persisted form of an installed plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    pub plugin: Plugin,
    pub active: bool,
    /// Hex SHA-256 of the serialized manifest
    pub manifest_digest: String,
}

impl PluginRecord {
    /// Build a record for persistence. `last_executed` is runtime-only and is cleared.
    pub fn new(mut plugin: Plugin, active: bool) -> Result<Self> {
        plugin.last_executed = None;
        let manifest_digest = manifest_digest(&plugin.manifest)?;
        Ok(Self {
            plugin,
            active,
            manifest_digest,
        })
    }

    /// Whether the stored manifest still matches its digest
    pub fn verify(&self) -> Result<bool> {
        Ok(manifest_digest(&self.plugin.manifest)? == self.manifest_digest)
    }
}

pub fn manifest_digest(manifest: &PluginManifest) -> Result<String> {
    let serialized = serde_json::to_vec(manifest).map_err(|e| {
        PluginError::Storage(format!("Failed to serialize manifest for digest: {e}"))
    })?;

    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Ok(hex::encode(hasher.finalize()))
}

/// Durable-storage collaborator
#[async_trait]
pub trait PluginStorage: Send + Sync {
    /// Every persisted record, in no particular order
    async fn load_all(&self) -> Result<Vec<PluginRecord>>;

    /// Insert or replace the record for `record.plugin.id`
    async fn save(&self, record: &PluginRecord) -> Result<()>;

    /// Remove the record. Removing a missing record is not an error.
    async fn remove(&self, plugin_id: Uuid) -> Result<()>;

    /// Delete the plugin's private data directory
    async fn delete_data_dir(&self, plugin_id: Uuid) -> Result<()>;
}

/// In-memory storage. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: RwLock<HashMap<Uuid, PluginRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PluginStorage for MemoryStorage {
    async fn load_all(&self) -> Result<Vec<PluginRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn save(&self, record: &PluginRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.plugin.id, record.clone());
        Ok(())
    }

    async fn remove(&self, plugin_id: Uuid) -> Result<()> {
        self.records.write().await.remove(&plugin_id);
        Ok(())
    }

    async fn delete_data_dir(&self, _plugin_id: Uuid) -> Result<()> {
        Ok(())
    }
}

/// JSON-file storage rooted at a directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn records_dir(&self) -> PathBuf {
        self.root.join("plugins")
    }

    fn record_path(&self, plugin_id: Uuid) -> PathBuf {
        self.records_dir().join(format!("{plugin_id}.json"))
    }

    /// Private data directory of a plugin
    pub fn data_dir(&self, plugin_id: Uuid) -> PathBuf {
        self.root.join("data").join(plugin_id.to_string())
    }

    async fn read_record(path: &Path) -> Result<PluginRecord> {
        let data = fs::read_to_string(path).await?;
        serde_json::from_str(&data)
            .map_err(|e| PluginError::Storage(format!("Invalid record {}: {e}", path.display())))
    }
}

#[async_trait]
impl PluginStorage for FileStorage {
    async fn load_all(&self) -> Result<Vec<PluginRecord>> {
        let dir = self.records_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match Self::read_record(&path).await {
                Ok(record) => {
                    if record.verify()? {
                        records.push(record);
                    } else {
                        warn!(
                            plugin_id = %record.plugin.id,
                            path = %path.display(),
                            "Skipping plugin record with mismatched manifest digest"
                        );
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable plugin record");
                }
            }
        }

        debug!(count = records.len(), root = %self.root.display(), "Loaded plugin records");
        Ok(records)
    }

    async fn save(&self, record: &PluginRecord) -> Result<()> {
        let plugin_id = record.plugin.id;
        fs::create_dir_all(self.records_dir()).await?;
        fs::create_dir_all(self.data_dir(plugin_id)).await?;

        let contents = serde_json::to_vec_pretty(record)
            .map_err(|e| PluginError::Storage(format!("Failed to serialize record: {e}")))?;

        let path = self.record_path(plugin_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, plugin_id: Uuid) -> Result<()> {
        match fs::remove_file(self.record_path(plugin_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_data_dir(&self, plugin_id: Uuid) -> Result<()> {
        match fs::remove_dir_all(self.data_dir(plugin_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
