//! Single snapshot capture: fetch -> store -> publish.
//!
//! The three steps run strictly in order. An object is always stored before
//! it is announced, so a consumer reacting to a notification can read it. A
//! failed publish is not rolled back; the stored object stays in place.

use crate::broker::{BrokerError, ImageNotification, MessageBroker, TopicDescriptor};
use crate::camera::{CameraError, CameraSource};
use crate::object_store::{ObjectStore, StoreError};
use crate::ring::PartitionRing;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Extension appended to every snapshot key
pub const SNAPSHOT_EXTENSION: &str = ".jpeg";

/// Content type recorded on stored snapshots
pub const SNAPSHOT_CONTENT_TYPE: &str = "image/jpeg";

/// Source of capture timestamps
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Pipeline step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStage {
    Fetch,
    Store,
    Publish,
}

impl CaptureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureStage::Fetch => "fetch",
            CaptureStage::Store => "store",
            CaptureStage::Publish => "publish",
        }
    }
}

impl fmt::Display for CaptureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A capture that failed at one stage
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture failed at fetch: {0}")]
    Fetch(#[source] CameraError),

    #[error("Capture failed at store of {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Capture failed at publish of {key}: {source}")]
    Publish {
        key: String,
        #[source]
        source: BrokerError,
    },
}

impl CaptureError {
    pub fn stage(&self) -> CaptureStage {
        match self {
            CaptureError::Fetch(_) => CaptureStage::Fetch,
            CaptureError::Store { .. } => CaptureStage::Store,
            CaptureError::Publish { .. } => CaptureStage::Publish,
        }
    }
}

/// Snapshot bytes and where they were written
#[derive(Debug, Clone)]
pub struct CaptureRecord {
    pub bytes: Bytes,
    pub destination_key: String,
}

/// Fetch/store/publish orchestration for one snapshot
pub struct CapturePipeline {
    ring: PartitionRing,
    camera: Arc<dyn CameraSource>,
    store: Arc<dyn ObjectStore>,
    broker: Arc<dyn MessageBroker>,
    topic: TopicDescriptor,
    clock: Arc<dyn Clock>,
}

impl CapturePipeline {
    /// Create a pipeline using the wall clock
    pub fn new(
        ring: PartitionRing,
        camera: Arc<dyn CameraSource>,
        store: Arc<dyn ObjectStore>,
        broker: Arc<dyn MessageBroker>,
        topic: TopicDescriptor,
    ) -> Self {
        Self {
            ring,
            camera,
            store,
            broker,
            topic,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the wall clock used for keys and message timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Descriptor every notification is published on
    pub fn topic(&self) -> &TopicDescriptor {
        &self.topic
    }

    /// Capture one snapshot into partition `head`
    #[instrument(skip(self))]
    pub async fn capture(&self, head: usize) -> Result<CaptureRecord, CaptureError> {
        let key = format!(
            "{}{}",
            self.ring.object_key(head, self.clock.now_millis()),
            SNAPSHOT_EXTENSION
        );

        debug!(key = %key, "Pulling image");
        let bytes = self.camera.fetch().await.map_err(CaptureError::Fetch)?;

        debug!(key = %key, size_bytes = bytes.len(), "Saving image");
        self.store
            .put_object(&key, bytes.clone(), SNAPSHOT_CONTENT_TYPE)
            .await
            .map_err(|source| CaptureError::Store {
                key: key.clone(),
                source,
            })?;

        debug!(key = %key, "Sending message");
        let notification = ImageNotification {
            bucket: self.store.bucket().to_string(),
            key: key.clone(),
        };
        let published = match notification.to_payload() {
            Ok(payload) => {
                self.broker
                    .publish(&self.topic, &payload, self.clock.now_millis())
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(source) = published {
            warn!(key = %key, "Snapshot stored but not announced");
            return Err(CaptureError::Publish { key, source });
        }

        info!(key = %key, size_bytes = bytes.len(), "Snapshot captured");
        Ok(CaptureRecord {
            bytes,
            destination_key: key,
        })
    }
}
