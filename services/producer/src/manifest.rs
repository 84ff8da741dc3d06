//! Durable record of the ring tail.
//!
//! The manifest is a single JSON object (`{"tail": 3}`) stored next to the
//! partitions. It is the only state that survives a restart; everything else
//! is rebuilt from it.

use crate::object_store::{ObjectStore, StoreError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Persisted ring position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Oldest partition still holding data
    pub tail: usize,
}

/// Errors raised by manifest reads and writes
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Manifest not found at {0}")]
    NotFound(String),

    #[error("Manifest store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("Manifest at {key} is corrupt: {message}")]
    Corrupt { key: String, message: String },
}

/// Reads and writes the manifest object
pub struct ManifestStore {
    store: Arc<dyn ObjectStore>,
    key: String,
    partitions: usize,
}

impl ManifestStore {
    /// Create a manifest store for a ring with `partitions` partitions
    pub fn new(store: Arc<dyn ObjectStore>, key: impl Into<String>, partitions: usize) -> Self {
        Self {
            store,
            key: key.into(),
            partitions,
        }
    }

    /// Key of the manifest object
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the manifest, validating the tail against the ring size
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn load(&self) -> Result<Manifest, ManifestError> {
        let body = self.store.get_object(&self.key).await.map_err(|e| match e {
            StoreError::NotFound(_) => ManifestError::NotFound(self.key.clone()),
            other => ManifestError::StoreUnavailable(other),
        })?;

        let manifest: Manifest =
            serde_json::from_slice(&body).map_err(|e| ManifestError::Corrupt {
                key: self.key.clone(),
                message: e.to_string(),
            })?;

        if manifest.tail >= self.partitions {
            return Err(ManifestError::Corrupt {
                key: self.key.clone(),
                message: format!(
                    "tail {} is outside a ring of {} partitions",
                    manifest.tail, self.partitions
                ),
            });
        }

        debug!(tail = manifest.tail, "Manifest loaded");
        Ok(manifest)
    }

    /// Replace the manifest with a new tail in a single put
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn save(&self, tail: usize) -> Result<(), ManifestError> {
        let body = serde_json::to_vec(&Manifest { tail }).map_err(|e| ManifestError::Corrupt {
            key: self.key.clone(),
            message: e.to_string(),
        })?;

        self.store
            .put_object(&self.key, Bytes::from(body), "application/json")
            .await
            .map_err(ManifestError::StoreUnavailable)?;

        debug!(tail, "Manifest saved");
        Ok(())
    }

    /// Load the manifest, creating it with `initial_tail` on first run.
    ///
    /// Returns the manifest and whether it was created by this call.
    pub async fn load_or_init(&self, initial_tail: usize) -> Result<(Manifest, bool), ManifestError> {
        match self.load().await {
            Ok(manifest) => Ok((manifest, false)),
            Err(ManifestError::NotFound(_)) => {
                self.save(initial_tail).await?;
                info!(key = %self.key, tail = initial_tail, "Initialized new manifest");
                Ok((Manifest { tail: initial_tail }, true))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryObjectStore;

    fn manifest_store(store: &MemoryObjectStore, partitions: usize) -> ManifestStore {
        ManifestStore::new(Arc::new(store.clone()), "cam/manifest.json", partitions)
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let store = MemoryObjectStore::with_bucket("b");
        let manifests = manifest_store(&store, 5);

        manifests.save(3).await.unwrap();
        assert_eq!(manifests.load().await.unwrap(), Manifest { tail: 3 });
        assert_eq!(
            store.object("cam/manifest.json").unwrap(),
            Bytes::from_static(br#"{"tail":3}"#)
        );
    }

    #[tokio::test]
    async fn test_missing_manifest_is_not_found() {
        let store = MemoryObjectStore::with_bucket("b");
        assert!(matches!(
            manifest_store(&store, 3).load().await,
            Err(ManifestError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_backing_failure_is_unavailable() {
        let store = MemoryObjectStore::with_bucket("b");
        store.inject_failure("cam/");
        let manifests = manifest_store(&store, 3);

        assert!(matches!(manifests.load().await, Err(ManifestError::StoreUnavailable(_))));
        assert!(matches!(manifests.save(1).await, Err(ManifestError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_load_or_init_creates_once() {
        let store = MemoryObjectStore::with_bucket("b");
        let manifests = manifest_store(&store, 3);

        assert_eq!(manifests.load_or_init(0).await.unwrap(), (Manifest { tail: 0 }, true));
        manifests.save(2).await.unwrap();
        assert_eq!(manifests.load_or_init(0).await.unwrap(), (Manifest { tail: 2 }, false));
    }

    #[tokio::test]
    async fn test_out_of_range_tail_is_corrupt() {
        let store = MemoryObjectStore::with_bucket("b");
        manifest_store(&store, 10).save(7).await.unwrap();

        assert!(matches!(
            manifest_store(&store, 4).load().await,
            Err(ManifestError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_garbage_body_is_corrupt() {
        let store = MemoryObjectStore::with_bucket("b");
        store
            .put_object("cam/manifest.json", Bytes::from_static(b"not json"), "text/plain")
            .await
            .unwrap();

        assert!(matches!(
            manifest_store(&store, 3).load().await,
            Err(ManifestError::Corrupt { .. })
        ));
    }
}
