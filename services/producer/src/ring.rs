//! Partition ring arithmetic for bounded snapshot storage.
//!
//! Captured images are spread over a fixed number of partitions that are
//! written one after another. When the writer wraps around and catches up
//! with the oldest partition, that partition is cleared before it is reused.
//! Everything in this module is pure: the ring never touches storage, it only
//! derives names and decisions from the values handed to it.
//!
//! ```text
//!   prefix/0-frames/   prefix/1-frames/   prefix/2-frames/
//!   ┌────────────┐     ┌────────────┐     ┌────────────┐
//!   │  head ───▶ │     │  ◀─── tail │     │            │
//!   └────────────┘     └────────────┘     └────────────┘
//! ```

use crate::config::RingConfig;
use thiserror::Error;

/// Errors raised when building a ring from invalid parameters
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RingError {
    #[error("Invalid ring parameter {name}: {message}")]
    InvalidParameter { name: &'static str, message: String },
}

/// In-memory cursor over the ring, owned by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingState {
    /// Partition currently receiving writes
    pub head: usize,
    /// Oldest partition still holding data
    pub tail: usize,
    /// Writes attempted into `head` since it was last cleared
    pub size: usize,
}

impl RingState {
    /// Cursor for a ring resuming from a persisted tail.
    ///
    /// Writing restarts at the persisted tail and every other partition is
    /// assumed to hold data, so the next eviction candidate is the one after it.
    pub fn resume(ring: &PartitionRing, manifest_tail: usize) -> Self {
        Self {
            head: manifest_tail,
            tail: ring.next_index(manifest_tail),
            size: 0,
        }
    }
}

/// Stateless partition naming and rotation rules.
#[derive(Debug, Clone)]
pub struct PartitionRing {
    partitions: usize,
    capacity: usize,
    prefix: String,
    delimiter: String,
    label: String,
    manifest: String,
    width: usize,
}

impl PartitionRing {
    /// Create a ring with the given geometry and naming scheme
    pub fn new(
        partitions: usize,
        capacity: usize,
        prefix: impl Into<String>,
        delimiter: impl Into<String>,
        label: impl Into<String>,
        manifest: impl Into<String>,
    ) -> Result<Self, RingError> {
        if partitions == 0 {
            return Err(RingError::InvalidParameter {
                name: "partitions",
                message: "must be at least 1".to_string(),
            });
        }
        if capacity == 0 {
            return Err(RingError::InvalidParameter {
                name: "partition_size",
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            partitions,
            capacity,
            prefix: prefix.into(),
            delimiter: delimiter.into(),
            label: label.into(),
            manifest: manifest.into(),
            width: digits_for(partitions - 1),
        })
    }

    /// Build a ring from the `ring` configuration section
    pub fn from_config(config: &RingConfig) -> Result<Self, RingError> {
        Self::new(
            config.partitions,
            config.partition_size,
            config.prefix.clone(),
            config.delimiter.clone(),
            config.partition_label.clone(),
            config.manifest.clone(),
        )
    }

    /// Number of partitions in the ring
    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Maximum number of writes per partition
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Key prefix shared by every object in partition `index`.
    ///
    /// Format: `{prefix}{delim}{index:0width}-{label}{delim}`
    pub fn partition_key_prefix(&self, index: usize) -> String {
        format!(
            "{prefix}{delim}{index:0width$}-{label}{delim}",
            prefix = self.prefix,
            delim = self.delimiter,
            index = index,
            width = self.width,
            label = self.label,
        )
    }

    /// Object key (without extension) for a capture taken at `timestamp_ms`
    pub fn object_key(&self, index: usize, timestamp_ms: i64) -> String {
        format!("{}{}", self.partition_key_prefix(index), timestamp_ms)
    }

    /// Key of the manifest object
    pub fn manifest_key(&self) -> String {
        format!("{}{}{}", self.prefix, self.delimiter, self.manifest)
    }

    /// Successor of `index`, wrapping at the partition count
    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.partitions
    }

    /// Whether one more write would overflow a partition holding `size` objects
    pub fn is_capacity_exceeded(&self, size: usize) -> bool {
        is_capacity_exceeded(size, self.capacity)
    }

    /// Whether the head has caught up with the tail
    pub fn is_eviction_due(&self, head: usize, tail: usize) -> bool {
        head == tail
    }
}

/// Capacity check evaluated before the size counter is bumped for the next write
pub fn is_capacity_exceeded(size: usize, capacity: usize) -> bool {
    size + 1 > capacity
}

/// Decimal digits needed to print `n` (at least one)
fn digits_for(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}
