//! Configuration management for the camera producer.
//!
//! Configuration is layered: optional files first, then environment variables
//! prefixed with `PRODUCER` using `__` as the section separator
//! (`PRODUCER__RING__PARTITIONS=24` -> `ring.partitions`).

use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the producer
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Camera endpoint configuration
    pub camera: CameraConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Partition ring configuration
    pub ring: RingConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Tick scheduling configuration
    pub scheduler: SchedulerConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port; metrics are disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Network camera configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Snapshot URL returning a single JPEG frame
    pub url: String,
    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for snapshot storage
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Per-operation timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub operation_timeout_ms: u64,
}

/// Partition ring layout
#[derive(Debug, Clone, Deserialize)]
pub struct RingConfig {
    /// Namespace prefix for every key written by this camera
    pub prefix: String,
    /// Key path delimiter
    pub delimiter: String,
    /// Manifest object name under the prefix
    pub manifest: String,
    /// Label appended to each partition index
    pub partition_label: String,
    /// Number of partitions in the ring
    pub partitions: usize,
    /// Snapshots per partition before rotating
    pub partition_size: usize,
}

/// Kafka producer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Client ID for this connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Exchange name, used as the Kafka topic
    #[serde(default = "default_exchange")]
    pub exchange: String,
    /// Camera location announced with every snapshot
    pub location: String,
    /// Security protocol (plaintext, ssl, sasl_plaintext, sasl_ssl)
    #[serde(default = "default_security_protocol")]
    pub security_protocol: String,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Delivery and metadata timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Connection attempts before giving up
    #[serde(default = "default_connect_max_attempts")]
    pub connect_max_attempts: u32,
    /// Base delay between connection attempts in milliseconds
    #[serde(default = "default_connect_base_delay_ms")]
    pub connect_base_delay_ms: u64,
    /// Maximum delay between connection attempts in milliseconds
    #[serde(default = "default_connect_max_delay_ms")]
    pub connect_max_delay_ms: u64,
    /// Partitions used when the topic has to be created
    #[serde(default = "default_topic_partitions")]
    pub topic_partitions: i32,
    /// Replication factor used when the topic has to be created
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
}

/// How ticks are driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Tick every `poll_interval_ms` until stopped
    #[default]
    Interval,
    /// Run a single tick and exit with its outcome
    Once,
}

impl std::str::FromStr for RunMode {
    type Err = ConfigValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "interval" => Ok(RunMode::Interval),
            "once" => Ok(RunMode::Once),
            other => Err(ConfigValidationError::InvalidValue {
                field: "scheduler.mode".to_string(),
                message: format!("unknown mode '{other}', expected 'interval' or 'once'"),
            }),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between ticks in milliseconds
    pub poll_interval_ms: u64,
    /// Run mode
    #[serde(default)]
    pub mode: RunMode,
}

// Default value functions
fn default_service_name() -> String {
    "camera-producer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_client_id() -> String {
    "camera-producer".to_string()
}

fn default_exchange() -> String {
    "images".to_string()
}

fn default_security_protocol() -> String {
    "plaintext".to_string()
}

fn default_connect_max_attempts() -> u32 {
    10
}

fn default_connect_base_delay_ms() -> u64 {
    500
}

fn default_connect_max_delay_ms() -> u64 {
    30_000
}

fn default_topic_partitions() -> i32 {
    1
}

fn default_replication_factor() -> i32 {
    1
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

impl Config {
    /// Load configuration from config files and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/producer.{toml,yaml,json}`
    /// 2. `/etc/camera-producer/producer.{toml,yaml,json}`
    /// 3. Environment variables (prefixed with `PRODUCER__`)
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("config/producer").required(false))
            .add_source(config::File::with_name("/etc/camera-producer/producer").required(false))
            .add_source(
                config::Environment::with_prefix("PRODUCER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Validate values that deserialization alone cannot check.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        require_non_empty("camera.url", &self.camera.url)?;
        if !self.camera.url.starts_with("http://") && !self.camera.url.starts_with("https://") {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.url".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }

        require_non_empty("s3.bucket", &self.s3.bucket)?;
        require_non_empty("ring.prefix", &self.ring.prefix)?;
        require_non_empty("ring.delimiter", &self.ring.delimiter)?;
        require_non_empty("ring.manifest", &self.ring.manifest)?;
        require_non_empty("ring.partition_label", &self.ring.partition_label)?;

        if self.ring.partitions == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "ring.partitions".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.ring.partition_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "ring.partition_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        require_non_empty("kafka.bootstrap_servers", &self.kafka.bootstrap_servers)?;
        require_non_empty("kafka.exchange", &self.kafka.exchange)?;
        require_non_empty("kafka.location", &self.kafka.location)?;
        if self.kafka.connect_max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "kafka.connect_max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.scheduler.poll_interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "scheduler.poll_interval_ms".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Get the tick interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler.poll_interval_ms)
    }
}

impl CameraConfig {
    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl S3Config {
    /// Get operation timeout as Duration
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl KafkaConfig {
    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Get base connection retry delay as Duration
    pub fn connect_base_delay(&self) -> Duration {
        Duration::from_millis(self.connect_base_delay_ms)
    }

    /// Get maximum connection retry delay as Duration
    pub fn connect_max_delay(&self) -> Duration {
        Duration::from_millis(self.connect_max_delay_ms)
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ConfigValidationError> {
    if value.trim().is_empty() {
        return Err(ConfigValidationError::MissingField(field.to_string()));
    }
    Ok(())
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
