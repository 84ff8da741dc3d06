//! In-memory object store with operation recording.
//!
//! Used by tests. Every call is recorded so assertions can check ordering
//! (store before publish, clear before write), and failures can be injected
//! per key prefix.

use crate::object_store::{ObjectStore, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Record of a storage operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    HeadBucket,
    CreateBucket,
    Put { key: String, size: usize },
    Get { key: String },
    List { prefix: String },
    Delete { keys: Vec<String> },
}

#[derive(Debug, Default)]
struct Inner {
    bucket_exists: bool,
    objects: BTreeMap<String, Bytes>,
    operations: Vec<StoreOp>,
    fail_prefixes: Vec<String>,
    unavailable: bool,
}

/// Object store backed by a sorted in-memory map
#[derive(Debug, Clone)]
pub struct MemoryObjectStore {
    bucket: String,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryObjectStore {
    /// Create a store whose bucket does not exist yet
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Create a store whose bucket already exists
    pub fn with_bucket(bucket: impl Into<String>) -> Self {
        let store = Self::new(bucket);
        store.lock().bucket_exists = true;
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another test thread panicked mid-call
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every key starting with `prefix` fail with `Unavailable`
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.lock().fail_prefixes.push(prefix.into());
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.fail_prefixes.clear();
        inner.unavailable = false;
    }

    /// Make every operation, bucket checks included, fail with `Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Recorded operations, oldest first
    pub fn operations(&self) -> Vec<StoreOp> {
        self.lock().operations.clone()
    }

    /// Forget recorded operations
    pub fn clear_operations(&self) {
        self.lock().operations.clear();
    }

    /// All stored keys in lexical order
    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Stored keys under `prefix`
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Raw body stored at `key`
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.lock().objects.get(key).cloned()
    }

    pub fn bucket_exists(&self) -> bool {
        self.lock().bucket_exists
    }

    fn check(inner: &Inner, key: &str) -> Result<(), StoreError> {
        if inner.unavailable || inner.fail_prefixes.iter().any(|p| key.starts_with(p.as_str())) {
            return Err(StoreError::Unavailable(format!("Injected failure for key: {key}")));
        }
        if !inner.bucket_exists {
            return Err(StoreError::NotFound("bucket does not exist".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn head_bucket(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.operations.push(StoreOp::HeadBucket);
        if inner.unavailable {
            return Err(StoreError::Unavailable("Injected failure for bucket".to_string()));
        }
        if inner.bucket_exists {
            Ok(())
        } else {
            Err(StoreError::NotFound(self.bucket.clone()))
        }
    }

    async fn create_bucket(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.operations.push(StoreOp::CreateBucket);
        if inner.unavailable {
            return Err(StoreError::Unavailable("Injected failure for bucket".to_string()));
        }
        inner.bucket_exists = true;
        Ok(())
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        _content_type: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::check(&inner, key)?;
        inner.operations.push(StoreOp::Put {
            key: key.to_string(),
            size: body.len(),
        });
        inner.objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, StoreError> {
        let mut inner = self.lock();
        Self::check(&inner, key)?;
        inner.operations.push(StoreOp::Get {
            key: key.to_string(),
        });
        inner
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut inner = self.lock();
        Self::check(&inner, prefix)?;
        inner.operations.push(StoreOp::List {
            prefix: prefix.to_string(),
        });
        Ok(inner
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        for key in keys {
            Self::check(&inner, key)?;
        }
        inner.operations.push(StoreOp::Delete {
            keys: keys.to_vec(),
        });
        for key in keys {
            inner.objects.remove(key);
        }
        Ok(())
    }
}
