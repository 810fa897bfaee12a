//! Plugin discovery
//!
//! A catalog only lists manifests that could be installed; installing is
//! always an explicit registry call.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::manifest::PluginManifest;
use crate::{PluginError, Result};

/// Largest manifest file accepted from disk
pub const MAX_MANIFEST_BYTES: u64 = 64 * 1024;

/// File name looked up in each plugin directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Load, parse and validate a manifest file (JSON)
pub fn load_manifest(path: &Path) -> Result<PluginManifest> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() {
        return Err(PluginError::InvalidManifest(format!(
            "Manifest path {} cannot be a symlink",
            path.display()
        )));
    }
    if !metadata.is_file() {
        return Err(PluginError::InvalidManifest(format!(
            "Manifest path {} must be a regular file",
            path.display()
        )));
    }
    if metadata.len() > MAX_MANIFEST_BYTES {
        return Err(PluginError::InvalidManifest(format!(
            "Manifest file too large: {} bytes (limit {})",
            metadata.len(),
            MAX_MANIFEST_BYTES
        )));
    }

    let data = fs::read_to_string(path)?;
    let manifest: PluginManifest = serde_json::from_str(&data)
        .map_err(|e| PluginError::InvalidManifest(format!("Invalid manifest JSON: {e}")))?;

    manifest.validate()?;
    Ok(manifest)
}

/// One discoverable plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub manifest: PluginManifest,
    /// Where the manifest was read from, if it came from disk
    pub source: Option<PathBuf>,
}

#[async_trait]
pub trait PluginCatalog: Send + Sync {
    async fn discover(&self) -> Result<Vec<CatalogEntry>>;
}

/// Fixed listing
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    manifests: Vec<PluginManifest>,
}

impl StaticCatalog {
    pub fn new(manifests: Vec<PluginManifest>) -> Self {
        Self { manifests }
    }
}

#[async_trait]
impl PluginCatalog for StaticCatalog {
    async fn discover(&self) -> Result<Vec<CatalogEntry>> {
        Ok(self
            .manifests
            .iter()
            .cloned()
            .map(|manifest| CatalogEntry {
                manifest,
                source: None,
            })
            .collect())
    }
}

/// Scans `<root>/*/manifest.json`
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scan(&self) -> Result<Vec<CatalogEntry>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();

        let mut found = Vec::new();
        for dir in dirs {
            let path = dir.join(MANIFEST_FILE);
            if !path.exists() {
                continue;
            }

            match load_manifest(&path) {
                Ok(manifest) => found.push(CatalogEntry {
                    manifest,
                    source: Some(path),
                }),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping invalid plugin manifest")
                }
            }
        }

        debug!(root = %self.root.display(), count = found.len(), "Scanned plugin directory");
        Ok(found)
    }
}

#[async_trait]
impl PluginCatalog for DirectoryCatalog {
    async fn discover(&self) -> Result<Vec<CatalogEntry>> {
        let catalog = self.clone();
        tokio::task::spawn_blocking(move || catalog.scan())
            .await
            .map_err(|e| PluginError::Storage(format!("Catalog scan aborted: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Permission, PluginType};

    const VALID: &str = r#"{
        "name": "notes",
        "version": "1.2.3",
        "description": "Note taking",
        "author": "Tessera",
        "permissions": ["dataStorage", "fileSystemRead"],
        "entryPoint": "builtin:echo",
        "type": "dataSource",
        "autoEnable": true,
        "acceptsMessages": false
    }"#;

    fn write_plugin(root: &Path, dir: &str, contents: &str) -> PathBuf {
        let plugin_dir = root.join(dir);
        fs::create_dir_all(&plugin_dir).expect("create plugin dir");
        let path = plugin_dir.join(MANIFEST_FILE);
        fs::write(&path, contents).expect("write manifest");
        path
    }

    #[test]
    fn test_load_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_plugin(dir.path(), "notes", VALID);

        let manifest = load_manifest(&path).expect("load");
        assert_eq!(manifest.name, "notes");
        assert_eq!(manifest.plugin_type, PluginType::DataSource);
        assert!(manifest.requests(Permission::DataStorage));
    }

    #[test]
    fn test_load_manifest_rejects_oversized_and_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");

        let big = format!(
            r#"{{"name":"big","description":"{}"}}"#,
            "x".repeat(MAX_MANIFEST_BYTES as usize)
        );
        let path = write_plugin(dir.path(), "big", &big);
        let err = load_manifest(&path).unwrap_err();
        assert!(err.to_string().contains("too large"));

        let path = write_plugin(dir.path(), "broken", "{");
        let err = load_manifest(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid manifest JSON"));

        let path = write_plugin(dir.path(), "semver", &VALID.replace("1.2.3", "1.2"));
        assert!(matches!(
            load_manifest(&path),
            Err(PluginError::InvalidManifest(_))
        ));
    }

    #[tokio::test]
    async fn test_directory_catalog_skips_invalid_manifests() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_plugin(dir.path(), "a-notes", VALID);
        write_plugin(dir.path(), "b-broken", "not json");
        write_plugin(
            dir.path(),
            "c-forbidden",
            &VALID.replace(
                r#"["dataStorage", "fileSystemRead"]"#,
                r#"["systemCommands", "networkAccess"]"#,
            ),
        );
        fs::create_dir_all(dir.path().join("d-empty")).expect("create dir");
        fs::write(dir.path().join("stray.json"), VALID).expect("write stray");

        let entries = DirectoryCatalog::new(dir.path())
            .discover()
            .await
            .expect("discover");

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].manifest.name, "notes");
        assert_eq!(
            entries[0].source.as_deref(),
            Some(dir.path().join("a-notes").join(MANIFEST_FILE).as_path())
        );
    }

    #[tokio::test]
    async fn test_directory_catalog_missing_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let entries = DirectoryCatalog::new(dir.path().join("absent"))
            .discover()
            .await
            .expect("discover");
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_static_catalog() {
        let manifest: PluginManifest = serde_json::from_str(VALID).expect("parse");
        let entries = StaticCatalog::new(vec![manifest.clone()])
            .discover()
            .await
            .expect("discover");
        assert_eq!(
            entries,
            vec![CatalogEntry {
                manifest,
                source: None
            }]
        );
    }
}
