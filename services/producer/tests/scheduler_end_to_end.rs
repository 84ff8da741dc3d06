//! Drives the scheduler through whole laps of the ring against in-memory
//! collaborators and checks what ends up in storage and on the bus.

use async_trait::async_trait;
use bytes::Bytes;
use camera_producer::{
    BrokerError, CameraError, CameraSource, CapturePipeline, CaptureStage, Clock,
    ImageNotification, MemoryObjectStore, MessageBroker, ObjectStore, PartitionRing, RingState,
    Scheduler, TopicDescriptor,
};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct FixedFrameCamera {
    calls: AtomicUsize,
    fail_on: Option<usize>,
}

impl FixedFrameCamera {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_on: None,
        }
    }

    fn failing_on(call: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_on: Some(call),
        }
    }
}

#[async_trait]
impl CameraSource for FixedFrameCamera {
    async fn fetch(&self) -> Result<Bytes, CameraError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on == Some(call) {
            return Err(CameraError::Status { status: 503 });
        }
        Ok(Bytes::from_static(b"\xff\xd8\xff\xe0frame"))
    }
}

#[derive(Debug, Clone)]
struct Published {
    topic: String,
    routing_key: String,
    payload: String,
    timestamp_ms: i64,
}

#[derive(Default)]
struct RecordingBroker {
    published: Mutex<Vec<Published>>,
    down: AtomicBool,
}

impl RecordingBroker {
    fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageBroker for RecordingBroker {
    async fn declare_topic(&self, _descriptor: &TopicDescriptor) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn publish(
        &self,
        descriptor: &TopicDescriptor,
        payload: &str,
        timestamp_ms: i64,
    ) -> Result<(), BrokerError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BrokerError::SendError {
                topic: descriptor.exchange.clone(),
                message: "broker down".to_string(),
            });
        }
        self.published.lock().unwrap().push(Published {
            topic: descriptor.exchange.clone(),
            routing_key: descriptor.routing_key(),
            payload: payload.to_string(),
            timestamp_ms,
        });
        Ok(())
    }
}

/// Ten milliseconds per reading, so every capture lands on a fresh key
struct TickingClock(AtomicI64);

impl Clock for TickingClock {
    fn now_millis(&self) -> i64 {
        self.0.fetch_add(10, Ordering::SeqCst)
    }
}

fn ring(partitions: usize, capacity: usize) -> PartitionRing {
    PartitionRing::new(partitions, capacity, "canal", "/", "PARTITION", "manifest.json").unwrap()
}

async fn scheduler(
    ring: PartitionRing,
    store: &MemoryObjectStore,
    camera: FixedFrameCamera,
    broker: Arc<RecordingBroker>,
) -> Scheduler {
    let pipeline = CapturePipeline::new(
        ring.clone(),
        Arc::new(camera),
        Arc::new(store.clone()),
        broker,
        TopicDescriptor::raw_jpeg("images", "canalParkingLot"),
    )
    .with_clock(Arc::new(TickingClock(AtomicI64::new(1_700_000_000_000))));

    Scheduler::start(ring, Arc::new(store.clone()), pipeline)
        .await
        .unwrap()
}

async fn manifest_body(store: &MemoryObjectStore) -> String {
    let body = store.get_object("canal/manifest.json").await.unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

#[tokio::test]
async fn test_every_stored_snapshot_is_announced() {
    let store = MemoryObjectStore::new("snapshots");
    let broker = Arc::new(RecordingBroker::default());
    let mut scheduler = scheduler(ring(3, 2), &store, FixedFrameCamera::new(), broker.clone()).await;

    for _ in 0..4 {
        assert!(scheduler.tick().await.outcome.is_ok());
    }

    let published = broker.published();
    assert_eq!(published.len(), 4);
    for message in &published {
        assert_eq!(message.topic, "images");
        assert_eq!(message.routing_key, "canalParkingLot.raw.jpeg");

        let notification: ImageNotification = serde_json::from_str(&message.payload).unwrap();
        assert_eq!(notification.bucket, "snapshots");
        assert!(notification.key.ends_with(".jpeg"));
        assert!(store.object(&notification.key).is_some());
        assert!(message.timestamp_ms >= 1_700_000_000_000);
    }
}

#[tokio::test]
async fn test_storage_stays_bounded_over_many_laps() {
    let (n, c) = (4, 3);
    let store = MemoryObjectStore::with_bucket("snapshots");
    let broker = Arc::new(RecordingBroker::default());
    let mut scheduler = scheduler(ring(n, c), &store, FixedFrameCamera::new(), broker).await;

    for _ in 0..n * c * 5 {
        scheduler.tick().await;
        let snapshots = store
            .keys_with_prefix("canal/")
            .into_iter()
            .filter(|k| k.ends_with(".jpeg"))
            .count();
        assert!(snapshots <= n * c);
    }

    for index in 0..n {
        let prefix = scheduler.ring().partition_key_prefix(index);
        assert!(store.keys_with_prefix(&prefix).len() <= c);
    }
}

#[tokio::test]
async fn test_three_partition_lap_persists_tail() {
    let store = MemoryObjectStore::with_bucket("snapshots");
    let broker = Arc::new(RecordingBroker::default());
    let mut scheduler = scheduler(ring(3, 2), &store, FixedFrameCamera::new(), broker).await;

    assert_eq!(manifest_body(&store).await, r#"{"tail":0}"#);

    scheduler.tick().await;
    scheduler.tick().await;
    let third = scheduler.tick().await;

    assert!(third.evicted);
    assert_eq!(third.state, RingState { head: 1, tail: 2, size: 1 });
    assert_eq!(manifest_body(&store).await, r#"{"tail":2}"#);
    assert_eq!(store.keys_with_prefix("canal/0-PARTITION/").len(), 2);
    assert_eq!(store.keys_with_prefix("canal/1-PARTITION/").len(), 1);
}

#[tokio::test]
async fn test_failures_are_contained_to_their_tick() {
    let store = MemoryObjectStore::with_bucket("snapshots");
    let broker = Arc::new(RecordingBroker::default());
    let mut scheduler = scheduler(
        ring(2, 2),
        &store,
        FixedFrameCamera::failing_on(2),
        broker.clone(),
    )
    .await;

    assert!(scheduler.tick().await.outcome.is_ok());

    let failed = scheduler.tick().await;
    assert_eq!(failed.outcome.unwrap_err().stage(), CaptureStage::Fetch);
    assert_eq!(failed.state.size, 2);

    broker.down.store(true, Ordering::SeqCst);
    let unannounced = scheduler.tick().await;
    assert!(unannounced.rotated);
    assert_eq!(unannounced.outcome.unwrap_err().stage(), CaptureStage::Publish);
    // Stored even though nobody was told about it
    assert_eq!(store.keys_with_prefix("canal/1-PARTITION/").len(), 1);

    broker.down.store(false, Ordering::SeqCst);
    assert!(scheduler.tick().await.outcome.is_ok());
    assert_eq!(broker.published().len(), 2);
}

#[tokio::test]
async fn test_restart_picks_up_from_manifest() {
    let store = MemoryObjectStore::with_bucket("snapshots");
    let broker = Arc::new(RecordingBroker::default());

    let mut first = scheduler(ring(3, 2), &store, FixedFrameCamera::new(), broker.clone()).await;
    for _ in 0..5 {
        first.tick().await;
    }
    assert_eq!(first.state(), RingState { head: 2, tail: 0, size: 1 });
    drop(first);

    let mut second = scheduler(ring(3, 2), &store, FixedFrameCamera::new(), broker).await;
    assert_eq!(second.state(), RingState { head: 0, tail: 1, size: 0 });
    // The resumed head partition is emptied before the first write
    assert!(store.keys_with_prefix("canal/0-PARTITION/").is_empty());

    let report = second.tick().await;
    assert_eq!(report.state, RingState { head: 0, tail: 1, size: 1 });
    assert!(report
        .outcome
        .unwrap()
        .destination_key
        .starts_with("canal/0-PARTITION/"));
}

#[tokio::test]
async fn test_interval_run_stops_on_cancel() {
    let store = MemoryObjectStore::with_bucket("snapshots");
    let broker = Arc::new(RecordingBroker::default());
    let mut scheduler = scheduler(ring(3, 2), &store, FixedFrameCamera::new(), broker.clone()).await;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        trigger.cancel();
    });

    let ticks = scheduler.run(Duration::from_millis(10), shutdown).await;

    assert!(ticks >= 1);
    assert_eq!(broker.published().len() as u64, ticks);
}
