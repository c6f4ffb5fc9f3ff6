//! Manifest sources.
//!
//! A manifest source is an opaque supplier of plugin descriptors. Discovery
//! order is significant: the resolver breaks ordering ties with it.

use crate::core::{sync, Error, Result};
use crate::manifest::types::Manifest;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Supplier of available plugin manifests.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Discover all available manifests, in a stable order.
    async fn discover(&self) -> Result<Vec<Manifest>>;
}

/// In-memory manifest source.
#[derive(Default)]
pub struct StaticManifestSource {
    manifests: RwLock<Vec<Manifest>>,
}

impl StaticManifestSource {
    /// Create a source over a fixed list.
    pub fn new(manifests: Vec<Manifest>) -> Self {
        Self {
            manifests: RwLock::new(manifests),
        }
    }

    /// Add or replace a manifest, keeping its original position.
    pub fn upsert(&self, manifest: Manifest) {
        let mut manifests = sync::write(&self.manifests);
        match manifests.iter_mut().find(|m| m.id == manifest.id) {
            Some(existing) => *existing = manifest,
            None => manifests.push(manifest),
        }
    }

    /// Remove a manifest.
    pub fn remove(&self, id: &str) -> bool {
        let mut manifests = sync::write(&self.manifests);
        let before = manifests.len();
        manifests.retain(|m| m.id != id);
        manifests.len() != before
    }

    /// Get a manifest by id.
    pub fn get(&self, id: &str) -> Option<Manifest> {
        sync::read(&self.manifests)
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }
}

#[async_trait]
impl ManifestSource for StaticManifestSource {
    async fn discover(&self) -> Result<Vec<Manifest>> {
        Ok(sync::read(&self.manifests).clone())
    }
}

/// Reads `*.json` descriptors from a directory, sorted by file name.
pub struct DirectoryManifestSource {
    dir: PathBuf,
}

impl DirectoryManifestSource {
    /// Create a source over a directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory being read.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the descriptor for a plugin id.
    pub fn descriptor_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Parse one descriptor file.
    pub async fn read_descriptor(path: &Path) -> Result<Manifest> {
        let text = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Source(format!("{}: {}", path.display(), e)))
    }

    async fn descriptor_files(&self) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl ManifestSource for DirectoryManifestSource {
    async fn discover(&self) -> Result<Vec<Manifest>> {
        let mut manifests = Vec::new();
        for path in self.descriptor_files().await? {
            // One malformed descriptor must not hide the others.
            match Self::read_descriptor(&path).await {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable plugin descriptor"),
            }
        }
        debug!(dir = %self.dir.display(), count = manifests.len(), "discovered plugin manifests");
        Ok(manifests)
    }
}
