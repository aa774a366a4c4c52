//! Client for the camera directory service
//!
//! Resolves a camera id to its source configuration when a viewer asks for a
//! stream that is not registered yet.

use camstream_core::{CameraConfig, CameraServiceConfig, Error, Result};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone)]
pub struct CameraServiceClient {
    client: reqwest::Client,
    base: Url,
}

impl CameraServiceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid camera service URL: {e}")))?;
        // keep the configured path when joining relative segments
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client, base })
    }

    /// Build a client from configuration; `None` when no service is configured
    pub fn from_config(config: &CameraServiceConfig) -> Result<Option<Self>> {
        config
            .url
            .as_deref()
            .map(|url| Self::new(url, Duration::from_secs(config.timeout_seconds)))
            .transpose()
    }

    /// Fetch `GET {base}/cameras/{id}`. A 404 means the camera does not exist.
    pub async fn lookup(&self, id: &str) -> Result<Option<CameraConfig>> {
        let mut url = self
            .base
            .join("cameras/")
            .map_err(|e| Error::Internal(format!("Invalid camera service URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| Error::Internal("Camera service URL cannot be a base".to_string()))?
            .pop_if_empty()
            .push(id);

        debug!(camera_id = id, url = %url, "Looking up camera");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("Camera service request failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let mut camera: CameraConfig = response
                    .json()
                    .await
                    .map_err(|e| Error::Upstream(format!("Invalid camera service response: {e}")))?;
                camera.id = id.to_string();
                Ok(Some(camera))
            }
            status => Err(Error::Upstream(format!(
                "Camera service returned {status}"
            ))),
        }
    }
}
