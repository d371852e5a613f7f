//! Product storage holds full product records and payload bytes; the index
//! holds only summaries. Storage is locked per product id, independent of
//! the index mutation lock, so concurrent reads of different products never
//! serialize against an ingestion in progress.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::error::IndexerError;
use crate::models::{Product, ProductId};

#[async_trait]
pub trait ProductStorage: Send + Sync {
    /// Store a product. Returns `IndexerError::AlreadyInStorage` when this
    /// exact version is already stored.
    async fn store(&self, product: &Product) -> Result<()>;

    /// Fetch a stored product, payload included.
    async fn get(&self, id: &ProductId) -> Result<Option<Product>>;

    /// Whether this exact version is stored.
    async fn has(&self, id: &ProductId) -> Result<bool>;

    /// Remove a stored product and its payload. Missing products are a no-op.
    async fn remove(&self, id: &ProductId) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct StoredProduct {
    product: Product,
    /// Hex SHA-256 of the payload bytes, when a payload exists.
    payload_digest: Option<String>,
}

/// Filesystem-backed product storage.
///
/// Records live at `root/source/type/code/<millis>.json`; payload bytes are
/// content-addressed under `root/payloads/<sha256>` so identical payloads
/// across versions share one file.
pub struct FileProductStorage {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl FileProductStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn record_path(&self, id: &ProductId) -> PathBuf {
        self.root
            .join(&id.source)
            .join(&id.product_type)
            .join(&id.code)
            .join(format!("{}.json", id.update_time.timestamp_millis()))
    }

    fn payload_path(&self, digest: &str) -> PathBuf {
        self.root.join("payloads").join(digest)
    }

    async fn lock_for(&self, id: &ProductId) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    #[cfg(test)]
    async fn lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[async_trait]
impl ProductStorage for FileProductStorage {
    async fn store(&self, product: &Product) -> Result<()> {
        let lock = self.lock_for(&product.id).await;
        let _guard = lock.write().await;

        let path = self.record_path(&product.id);
        if path.exists() {
            return Err(IndexerError::AlreadyInStorage(product.id.clone()).into());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let payload_digest = match &product.payload {
            Some(payload) => {
                let digest = format!("{:x}", Sha256::digest(payload));
                let payload_path = self.payload_path(&digest);
                if !payload_path.exists() {
                    if let Some(parent) = payload_path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&payload_path, payload).with_context(|| {
                        format!("Failed to write payload {}", payload_path.display())
                    })?;
                }
                Some(digest)
            }
            None => None,
        };

        let mut record = StoredProduct {
            product: product.clone(),
            payload_digest,
        };
        record.product.payload = None;

        let json = serde_json::to_vec_pretty(&record)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write product {}", path.display()))?;
        Ok(())
    }

    async fn get(&self, id: &ProductId) -> Result<Option<Product>> {
        let lock = self.lock_for(id).await;
        let _guard = lock.read().await;

        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read(&path)
            .with_context(|| format!("Failed to read product {}", path.display()))?;
        let record: StoredProduct = serde_json::from_slice(&json)?;

        let mut product = record.product;
        if let Some(digest) = &record.payload_digest {
            let payload_path = self.payload_path(digest);
            product.payload = Some(std::fs::read(&payload_path).with_context(|| {
                format!("Failed to read payload {}", payload_path.display())
            })?);
        }
        Ok(Some(product))
    }

    async fn has(&self, id: &ProductId) -> Result<bool> {
        let lock = self.lock_for(id).await;
        let _guard = lock.read().await;
        Ok(self.record_path(id).exists())
    }

    async fn remove(&self, id: &ProductId) -> Result<()> {
        let lock = self.lock_for(id).await;
        {
            let _guard = lock.write().await;
            let path = self.record_path(id);
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove product {}", path.display()))?;
                prune_empty_dirs(&self.root, path.parent());
            }
        }
        // the lock entry goes with the record; waiters keep their Arc clone
        self.locks.lock().await.remove(&id.to_string());
        Ok(())
    }
}

/// Remove now-empty source/type/code directories up to the storage root.
fn prune_empty_dirs(root: &Path, mut dir: Option<&Path>) {
    while let Some(current) = dir {
        if current == root {
            break;
        }
        if std::fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
}
