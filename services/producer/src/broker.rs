//! Snapshot announcements over Kafka.
//!
//! A [`TopicDescriptor`] names where a snapshot notification goes: the
//! exchange becomes the Kafka topic, and `location.sourceType.format` becomes
//! the message key so consumers can route on it. The descriptor fields are
//! also copied into message headers.

use crate::config::KafkaConfig;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur while talking to the broker
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to create Kafka client: {0}")]
    CreationError(String),

    #[error("Broker connection attempt failed: {0}")]
    Connect(String),

    #[error("Broker unreachable after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Failed to declare topic {topic}: {message}")]
    DeclareTopic { topic: String, message: String },

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },
}

/// Where snapshot notifications are published
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicDescriptor {
    /// Exchange name, mapped onto a Kafka topic
    pub exchange: String,
    /// Camera location
    pub location: String,
    /// Image source type
    pub source_type: String,
    /// Image format
    pub format: String,
}

impl TopicDescriptor {
    /// Descriptor for raw JPEG snapshots from `location`
    pub fn raw_jpeg(exchange: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            location: location.into(),
            source_type: "raw".to_string(),
            format: "jpeg".to_string(),
        }
    }

    /// Routing key `location.sourceType.format`
    pub fn routing_key(&self) -> String {
        format!("{}.{}.{}", self.location, self.source_type, self.format)
    }
}

/// Body of a snapshot notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageNotification {
    pub bucket: String,
    pub key: String,
}

impl ImageNotification {
    pub fn to_payload(&self) -> Result<String, BrokerError> {
        serde_json::to_string(self).map_err(|e| BrokerError::SerializationError(e.to_string()))
    }
}

/// Publishing side of the message bus
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Make sure the destination for `descriptor` exists
    async fn declare_topic(&self, descriptor: &TopicDescriptor) -> Result<(), BrokerError>;

    /// Publish `payload` with a millisecond timestamp
    async fn publish(
        &self,
        descriptor: &TopicDescriptor,
        payload: &str,
        timestamp_ms: i64,
    ) -> Result<(), BrokerError>;
}

/// Kafka-backed broker
pub struct KafkaBroker {
    producer: FutureProducer,
    client_config: ClientConfig,
    config: KafkaConfig,
}

impl KafkaBroker {
    /// Build the librdkafka client configuration
    fn build_client_config(config: &KafkaConfig) -> ClientConfig {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_id)
            .set("security.protocol", &config.security_protocol)
            .set("message.timeout.ms", config.request_timeout_ms.to_string())
            .set("request.timeout.ms", config.request_timeout_ms.to_string())
            .set("acks", "all");

        // Configure SASL if credentials provided
        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        client_config
    }

    /// Connect to the cluster, retrying with exponential backoff.
    ///
    /// Each attempt fetches cluster metadata within the request timeout. After
    /// `connect_max_attempts` failures the last error is reported as
    /// [`BrokerError::RetriesExhausted`].
    pub async fn connect_with_retry(config: &KafkaConfig) -> Result<Self, BrokerError> {
        let client_config = Self::build_client_config(config);
        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| BrokerError::CreationError(e.to_string()))?;

        let mut backoff = ExponentialBackoff {
            initial_interval: config.connect_base_delay(),
            max_interval: config.connect_max_delay(),
            max_elapsed_time: None,
            ..Default::default()
        };

        let max_attempts = config.connect_max_attempts.max(1);
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            match Self::probe(&producer, config.request_timeout()).await {
                Ok(brokers) => {
                    info!(
                        bootstrap_servers = %config.bootstrap_servers,
                        brokers = brokers,
                        attempts = attempts,
                        "Connected to Kafka"
                    );
                    return Ok(Self {
                        producer,
                        client_config,
                        config: config.clone(),
                    });
                }
                Err(e) if attempts >= max_attempts => {
                    error!(attempts = attempts, error = %e, "Max connection attempts exceeded");
                    return Err(BrokerError::RetriesExhausted {
                        attempts,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(config.connect_max_delay());
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Kafka connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Fetch cluster metadata once; returns the number of brokers seen
    async fn probe(producer: &FutureProducer, timeout: Duration) -> Result<usize, BrokerError> {
        let producer = producer.clone();

        // fetch_metadata blocks the calling thread
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, Timeout::After(timeout))
                .map(|metadata| metadata.brokers().len())
                .map_err(|e| BrokerError::Connect(e.to_string()))
        })
        .await
        .map_err(|e| BrokerError::Connect(e.to_string()))?
    }
}

#[async_trait]
impl MessageBroker for KafkaBroker {
    #[instrument(skip(self), fields(topic = %descriptor.exchange))]
    async fn declare_topic(&self, descriptor: &TopicDescriptor) -> Result<(), BrokerError> {
        let admin: AdminClient<DefaultClientContext> = self
            .client_config
            .create()
            .map_err(|e| BrokerError::CreationError(e.to_string()))?;

        let topic = NewTopic::new(
            &descriptor.exchange,
            self.config.topic_partitions,
            TopicReplication::Fixed(self.config.replication_factor),
        );
        let options = AdminOptions::new().operation_timeout(Some(self.config.request_timeout()));

        let results = admin
            .create_topics(&[topic], &options)
            .await
            .map_err(|e| BrokerError::DeclareTopic {
                topic: descriptor.exchange.clone(),
                message: e.to_string(),
            })?;

        for result in results {
            match result {
                Ok(name) => info!(topic = %name, "Topic created"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "Topic already exists")
                }
                Err((name, code)) => {
                    return Err(BrokerError::DeclareTopic {
                        topic: name,
                        message: code.to_string(),
                    })
                }
            }
        }

        Ok(())
    }

    #[instrument(skip(self, payload), fields(topic = %descriptor.exchange))]
    async fn publish(
        &self,
        descriptor: &TopicDescriptor,
        payload: &str,
        timestamp_ms: i64,
    ) -> Result<(), BrokerError> {
        let routing_key = descriptor.routing_key();
        let message_id = Uuid::new_v4().to_string();

        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "location",
                value: Some(descriptor.location.as_str()),
            })
            .insert(Header {
                key: "source-type",
                value: Some(descriptor.source_type.as_str()),
            })
            .insert(Header {
                key: "format",
                value: Some(descriptor.format.as_str()),
            })
            .insert(Header {
                key: "message-id",
                value: Some(message_id.as_str()),
            });

        let record = FutureRecord::to(&descriptor.exchange)
            .key(&routing_key)
            .payload(payload)
            .timestamp(timestamp_ms)
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.config.request_timeout()))
            .await
            .map_err(|(e, _)| BrokerError::SendError {
                topic: descriptor.exchange.clone(),
                message: e.to_string(),
            })?;

        debug!(
            routing_key = %routing_key,
            partition = partition,
            offset = offset,
            "Notification delivered"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_key() {
        let descriptor = TopicDescriptor::raw_jpeg("images", "canalParkingLot");
        assert_eq!(descriptor.routing_key(), "canalParkingLot.raw.jpeg");
    }

    #[test]
    fn test_descriptor_serializes_camel_case() {
        let descriptor = TopicDescriptor::raw_jpeg("images", "lot");
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["sourceType"], "raw");
        assert_eq!(json["format"], "jpeg");
    }

    #[test]
    fn test_notification_payload() {
        let notification = ImageNotification {
            bucket: "snapshots".to_string(),
            key: "lot/0-PARTITION/1700000000000.jpeg".to_string(),
        };
        assert_eq!(
            notification.to_payload().unwrap(),
            r#"{"bucket":"snapshots","key":"lot/0-PARTITION/1700000000000.jpeg"}"#
        );
    }

    #[tokio::test]
    async fn test_unreachable_cluster_exhausts_retries() {
        let mut config = crate::config::tests::create_test_config().kafka;
        // Nothing listens on the discard port
        config.bootstrap_servers = "127.0.0.1:9".to_string();
        config.request_timeout_ms = 200;
        config.connect_max_attempts = 2;
        config.connect_base_delay_ms = 10;
        config.connect_max_delay_ms = 20;

        let result = KafkaBroker::connect_with_retry(&config).await;

        assert!(matches!(
            result,
            Err(BrokerError::RetriesExhausted { attempts: 2, .. })
        ));
    }

    #[test]
    fn test_sasl_settings_only_with_credentials() {
        let mut config = crate::config::tests::create_test_config().kafka;
        let client_config = KafkaBroker::build_client_config(&config);
        assert_eq!(client_config.get("sasl.username"), None);
        assert_eq!(client_config.get("acks"), Some("all"));

        config.sasl_username = Some("producer".to_string());
        config.sasl_password = Some("secret".to_string());
        let client_config = KafkaBroker::build_client_config(&config);
        assert_eq!(client_config.get("sasl.username"), Some("producer"));
        assert_eq!(client_config.get("sasl.mechanisms"), Some("PLAIN"));
    }
}
