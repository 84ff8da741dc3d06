//! Snapshot retrieval from a network camera over HTTP.

use crate::config::CameraConfig;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors that can occur while fetching a snapshot
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Snapshot request failed: {0}")]
    Request(String),

    #[error("Camera returned HTTP {status}")]
    Status { status: u16 },
}

/// Source of raw snapshot bytes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CameraSource: Send + Sync {
    /// Fetch a single frame as opaque bytes
    async fn fetch(&self) -> Result<Bytes, CameraError>;
}

/// Camera exposing a JPEG snapshot URL
pub struct HttpCamera {
    client: reqwest::Client,
    url: String,
}

impl HttpCamera {
    /// Create a camera client with the configured request timeout
    pub fn new(config: &CameraConfig) -> Result<Self, CameraError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| CameraError::Client(e.to_string()))?;

        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl CameraSource for HttpCamera {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<Bytes, CameraError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| CameraError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CameraError::Status {
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| CameraError::Request(e.to_string()))?;

        debug!(size_bytes = body.len(), "Snapshot fetched");
        Ok(body)
    }
}
