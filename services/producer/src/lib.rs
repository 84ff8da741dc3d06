//! Camera Snapshot Producer
//!
//! Periodically pulls a JPEG snapshot from a network camera, stores it in an
//! S3 bucket and announces it on Kafka. Storage is bounded: snapshots are
//! spread over a fixed ring of partitions, and the oldest partition is emptied
//! before the writer wraps around into it. A small manifest object records the
//! ring tail so a restarted producer picks up where it left off.
//!
//! ## Architecture
//!
//! ```text
//!  Camera (HTTP)          S3 Bucket                     Kafka
//! ┌──────────────┐       ┌────────────────────┐        ┌──────────────┐
//! │ snapshot.jpg │       │ prefix/            │        │ images       │
//! └──────────────┘       │   manifest.json    │        │  key:        │
//!        │               │   0-PARTITION/     │        │  loc.raw.jpeg│
//!        ▼               │   1-PARTITION/     │        └──────────────┘
//! ┌──────────────┐  put  │   ...              │               ▲
//! │ Capture      │──────▶│                    │               │
//! │ Pipeline     │       └────────────────────┘               │
//! └──────────────┘──────────────────────────────────publish───┘
//!        ▲                        ▲
//!        │ tick                   │ clear / manifest
//! ┌──────────────┐                │
//! │ Scheduler    │────────────────┘
//! │ (ring state) │
//! └──────────────┘
//! ```

pub mod broker;
pub mod camera;
pub mod config;
pub mod manifest;
pub mod memory_store;
pub mod object_store;
pub mod pipeline;
pub mod ring;
pub mod scheduler;

pub use broker::{BrokerError, ImageNotification, KafkaBroker, MessageBroker, TopicDescriptor};
pub use camera::{CameraError, CameraSource, HttpCamera};
pub use config::{Config, RunMode};
pub use manifest::{Manifest, ManifestError, ManifestStore};
pub use memory_store::MemoryObjectStore;
pub use object_store::{ObjectStore, S3ObjectStore, StoreError};
pub use pipeline::{CaptureError, CapturePipeline, CaptureRecord, CaptureStage, Clock, SystemClock};
pub use ring::{PartitionRing, RingError, RingState};
pub use scheduler::{Scheduler, StartupError, TickReport};
