//! Content-addressed blob stores
//!
//! Pointers are `sha256-<hex>` digests of the stored bytes, so a put of the
//! same bytes twice yields the same pointer and stores nothing new.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::fs;
use tracing::{debug, info};

use super::BlobStore;
use crate::cipher::content_hash;
use crate::error::HealthError;

/// In-memory blob store (tests and ephemeral deployments)
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Overwrite a stored blob in place (for tamper tests)
    pub fn replace(&self, pointer: &str, data: Vec<u8>) -> bool {
        match self.blobs.get_mut(pointer) {
            Some(mut entry) => {
                *entry = data;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, data: &[u8]) -> Result<String, HealthError> {
        let pointer = content_hash(data);
        self.blobs.entry(pointer.clone()).or_insert_with(|| data.to_vec());
        Ok(pointer)
    }

    async fn get(&self, pointer: &str) -> Result<Vec<u8>, HealthError> {
        self.blobs
            .get(pointer)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| HealthError::Dependency(format!("blob {} not found", pointer)))
    }
}

/// Filesystem blob store under `<root>/<first 4 hex>/<pointer>`
pub struct FsBlobStore {
    root_dir: PathBuf,
}

impl FsBlobStore {
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self, HealthError> {
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(&root_dir).await?;

        info!(path = %root_dir.display(), "Initialized blob store");

        Ok(Self { root_dir })
    }

    fn blob_path(&self, pointer: &str) -> Result<PathBuf, HealthError> {
        let hex_part = pointer
            .strip_prefix("sha256-")
            .filter(|h| h.len() >= 4 && h.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| HealthError::Validation(format!("invalid blob pointer: {}", pointer)))?;

        Ok(self.root_dir.join(&hex_part[..4]).join(pointer))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, data: &[u8]) -> Result<String, HealthError> {
        let pointer = content_hash(data);
        let path = self.blob_path(&pointer)?;

        if fs::metadata(&path).await.is_ok() {
            debug!(pointer = %pointer, "Blob already exists");
            return Ok(pointer);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| HealthError::Dependency(format!("blob store unavailable: {}", e)))?;
        }

        // Write then rename so readers never see a partial blob
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, data)
            .await
            .map_err(|e| HealthError::Dependency(format!("blob write failed: {}", e)))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| HealthError::Dependency(format!("blob write failed: {}", e)))?;

        debug!(pointer = %pointer, size = data.len(), "Stored blob");
        Ok(pointer)
    }

    async fn get(&self, pointer: &str) -> Result<Vec<u8>, HealthError> {
        let path = self.blob_path(pointer)?;
        fs::read(&path)
            .await
            .map_err(|e| HealthError::Dependency(format!("blob {} unreadable: {}", pointer, e)))
    }
}
