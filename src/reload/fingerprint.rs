//! Change detection for plugin packages.

use crate::core::{ContentHash, Error, Result, Timestamp};
use crate::manifest::{DirectoryManifestSource, Manifest, StaticManifestSource};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;

/// What the monitor compares between polls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Declared version
    pub version: String,
    /// Content hash of the package or descriptor
    pub hash: ContentHash,
    /// Last modification time, when the source knows it
    pub last_modified: Option<Timestamp>,
}

impl Fingerprint {
    /// Fingerprint of a manifest value.
    pub fn of_manifest(manifest: &Manifest) -> Result<Self> {
        let bytes = serde_json::to_vec(manifest)?;
        Ok(Self {
            version: manifest.version.clone(),
            hash: ContentHash::of(&bytes),
            last_modified: None,
        })
    }
}

/// Supplies fingerprints for plugin ids.
#[async_trait]
pub trait FingerprintSource: Send + Sync {
    /// Current fingerprint, or `None` if the plugin is gone.
    async fn fingerprint(&self, plugin_id: &str) -> Result<Option<Fingerprint>>;
}

#[async_trait]
impl FingerprintSource for StaticManifestSource {
    async fn fingerprint(&self, plugin_id: &str) -> Result<Option<Fingerprint>> {
        self.get(plugin_id).map(|m| Fingerprint::of_manifest(&m)).transpose()
    }
}

/// Hashes `<dir>/<id>.json`; the version comes from the parsed descriptor.
#[async_trait]
impl FingerprintSource for DirectoryManifestSource {
    async fn fingerprint(&self, plugin_id: &str) -> Result<Option<Fingerprint>> {
        let path = self.descriptor_path(plugin_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Source(format!("{}: {}", path.display(), e)))?;
        let last_modified = tokio::fs::metadata(&path)
            .await?
            .modified()
            .ok()
            .map(Timestamp::from);

        Ok(Some(Fingerprint {
            version: manifest.version,
            hash: ContentHash::of(&bytes),
            last_modified,
        }))
    }
}
