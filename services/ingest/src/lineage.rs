//! Lineage resolution client.
//!
//! The lineage service owns the device → site → owner hierarchy; this core
//! only consumes it.  Resolution answers four questions per device: is it
//! mapped to an owning location, is it approved for operation, what timezone
//! does it live in, and what schedule applies (its own, or its site's).

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// The owning hierarchy and effective schedule for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLineage {
    pub device_id: String,
    /// False when no owning location claims this device yet.
    #[serde(default)]
    pub mapped: bool,
    /// False until an operator approves the device for operation.
    #[serde(default)]
    pub approved: bool,
    /// IANA timezone name, e.g. "America/New_York".
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub device_schedule: Option<String>,
    #[serde(default)]
    pub site_schedule: Option<String>,
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LineageError {
    #[error("lineage request failed: {0}")]
    Request(String),
    #[error("lineage response invalid: {0}")]
    Invalid(String),
}

/// Resolves a device identifier to its owning hierarchy.
pub trait LineageResolver: Send + Sync {
    fn resolve(
        &self,
        device_id: &str,
    ) -> impl Future<Output = Result<DeviceLineage, LineageError>> + Send;
}

/// HTTP lineage client.  Every call is bounded by the configured timeout;
/// a timeout is a failure, never silently retried here.
pub struct HttpLineageResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLineageResolver {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, LineageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LineageError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }
}

impl LineageResolver for HttpLineageResolver {
    async fn resolve(&self, device_id: &str) -> Result<DeviceLineage, LineageError> {
        let url = format!("{}/v1/devices/{}/lineage", self.base_url, device_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LineageError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(LineageError::Request(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }
        response
            .json::<DeviceLineage>()
            .await
            .map_err(|e| LineageError::Invalid(e.to_string()))
    }
}
