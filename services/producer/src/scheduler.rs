//! Tick driver and owner of the ring cursor.
//!
//! The scheduler is the only place [`RingState`] changes. Ticks are strictly
//! serial: a tick always finishes, successfully or with a logged failure,
//! before the next one is considered, and a stop request is only honored
//! between ticks.

use crate::broker::BrokerError;
use crate::manifest::{ManifestError, ManifestStore};
use crate::object_store::{ObjectStore, StoreError};
use crate::pipeline::{CaptureError, CapturePipeline, CaptureRecord};
use crate::ring::{PartitionRing, RingState};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Partition written by a brand new ring
pub const INITIAL_TAIL: usize = 0;

/// Failures that prevent the ring from starting
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Bucket {bucket} is unreachable: {source}")]
    Bucket {
        bucket: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Message broker unavailable: {0}")]
    Broker(#[from] BrokerError),

    #[error("Failed to clear partition {index} before writing: {source}")]
    ClearPartition {
        index: usize,
        #[source]
        source: StoreError,
    },
}

/// Outcome of a single tick
#[derive(Debug)]
pub struct TickReport {
    /// Ring cursor after the tick
    pub state: RingState,
    /// Head moved to the next partition on this tick
    pub rotated: bool,
    /// Head caught up with the tail and the partition was evicted
    pub evicted: bool,
    /// Capture pipeline result
    pub outcome: Result<CaptureRecord, CaptureError>,
}

/// Delete every object in partition `index`. Returns the number removed.
///
/// Clearing an empty partition issues no delete and is not an error.
pub async fn clear_partition(
    store: &dyn ObjectStore,
    ring: &PartitionRing,
    index: usize,
) -> Result<usize, StoreError> {
    let prefix = ring.partition_key_prefix(index);
    let keys = store.list_objects(&prefix).await?;
    if keys.is_empty() {
        return Ok(0);
    }

    store.delete_objects(&keys).await?;
    metrics::counter!("producer.objects.evicted").increment(keys.len() as u64);
    Ok(keys.len())
}

/// Make sure the bucket exists, creating it when absent
async fn ensure_bucket(store: &dyn ObjectStore) -> Result<(), StoreError> {
    match store.head_bucket().await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            info!(bucket = %store.bucket(), "Bucket not found, creating");
            store.create_bucket().await
        }
        Err(e) => Err(e),
    }
}

/// Drives the capture pipeline over the partition ring
pub struct Scheduler {
    ring: PartitionRing,
    state: RingState,
    store: Arc<dyn ObjectStore>,
    manifests: ManifestStore,
    pipeline: CapturePipeline,
}

impl Scheduler {
    /// Bring the ring up from durable state.
    ///
    /// Ensures the bucket exists, loads (or creates) the manifest, resumes the
    /// cursor at the persisted tail and clears that partition so writing always
    /// starts in an empty partition, even after a crash between a rotation and
    /// its clear.
    #[instrument(skip_all, fields(bucket = %store.bucket()))]
    pub async fn start(
        ring: PartitionRing,
        store: Arc<dyn ObjectStore>,
        pipeline: CapturePipeline,
    ) -> Result<Self, StartupError> {
        ensure_bucket(store.as_ref())
            .await
            .map_err(|source| StartupError::Bucket {
                bucket: store.bucket().to_string(),
                source,
            })?;

        let manifests = ManifestStore::new(store.clone(), ring.manifest_key(), ring.partitions());
        let (manifest, created) = manifests.load_or_init(INITIAL_TAIL).await?;

        let state = RingState::resume(&ring, manifest.tail);

        let cleared = clear_partition(store.as_ref(), &ring, state.head)
            .await
            .map_err(|source| StartupError::ClearPartition {
                index: state.head,
                source,
            })?;

        info!(
            head = state.head,
            tail = state.tail,
            partitions = ring.partitions(),
            capacity = ring.capacity(),
            new_manifest = created,
            cleared = cleared,
            "Partition ring ready"
        );

        let scheduler = Self {
            ring,
            state,
            store,
            manifests,
            pipeline,
        };
        scheduler.record_gauges();
        Ok(scheduler)
    }

    /// Current ring cursor
    pub fn state(&self) -> RingState {
        self.state
    }

    /// Ring geometry and naming
    pub fn ring(&self) -> &PartitionRing {
        &self.ring
    }

    /// Run one tick: rotate/evict if due, consume a slot, capture.
    pub async fn tick(&mut self) -> TickReport {
        let mut rotated = false;
        let mut evicted = false;

        if self.ring.is_capacity_exceeded(self.state.size) {
            self.state.size = 0;
            self.state.head = self.ring.next_index(self.state.head);
            rotated = true;

            if self.ring.is_eviction_due(self.state.head, self.state.tail) {
                evicted = true;
                self.evict_head().await;
            }
        }

        // Counted before the fetch; a failed capture still uses its slot
        self.state.size += 1;

        let outcome = self.pipeline.capture(self.state.head).await;
        match &outcome {
            Ok(_) => {
                metrics::counter!("producer.captures", "outcome" => "ok").increment(1);
            }
            Err(e) => {
                metrics::counter!("producer.captures", "outcome" => e.stage().as_str())
                    .increment(1);
                error!(
                    stage = %e.stage(),
                    head = self.state.head,
                    size = self.state.size,
                    error = %e,
                    "Capture failed"
                );
            }
        }
        self.record_gauges();

        TickReport {
            state: self.state,
            rotated,
            evicted,
            outcome,
        }
    }

    /// Clear the partition the head just moved into and advance the tail.
    async fn evict_head(&mut self) {
        let index = self.state.head;
        match clear_partition(self.store.as_ref(), &self.ring, index).await {
            Ok(removed) => {
                metrics::counter!("producer.partitions.cleared").increment(1);
                info!(partition = index, removed = removed, "Partition evicted");
            }
            Err(e) => {
                // Leftovers are removed on the next wrap or restart
                warn!(partition = index, error = %e, "Partition clear failed");
            }
        }

        self.state.tail = self.ring.next_index(self.state.tail);

        if let Err(e) = self.manifests.save(self.state.tail).await {
            metrics::counter!("producer.manifest.write_failures").increment(1);
            warn!(
                tail = self.state.tail,
                error = %e,
                "Manifest write failed, continuing with in-memory ring"
            );
        }
    }

    fn record_gauges(&self) {
        metrics::gauge!("producer.ring.head").set(self.state.head as f64);
        metrics::gauge!("producer.ring.tail").set(self.state.tail as f64);
        metrics::gauge!("producer.ring.size").set(self.state.size as f64);
    }

    /// Single-shot mode: run exactly one tick.
    pub async fn run_once(&mut self) -> Result<CaptureRecord, CaptureError> {
        self.tick().await.outcome
    }

    /// Interval mode: tick every `interval` until `shutdown` is cancelled.
    ///
    /// Cancellation is observed between ticks only; an in-flight tick always
    /// runs to completion. Returns the number of ticks executed.
    pub async fn run(&mut self, interval: Duration, shutdown: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut ticks = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.tick().await;
            ticks += 1;
        }

        info!(ticks = ticks, state = ?self.state, "Scheduler stopped");
        ticks
    }
}
