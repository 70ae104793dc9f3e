//! Downstream interfaces: durable artifact storage, completion notification,
//! and typed failure notification.
//!
//! Failures below the finalizer are reported through `notify_failure` and
//! otherwise swallowed locally — the triggering party is an unattended
//! device, not an interactive session, so nothing here raises to a caller
//! that expects a response.

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DownstreamError {
    #[error("downstream request failed: {0}")]
    Request(String),
    #[error("downstream response invalid: {0}")]
    Invalid(String),
}

/// The three consumed downstream interfaces.
///
/// `upload` writes assembled bytes and returns an addressable location;
/// `notify_complete` creates the downstream record linking an artifact to
/// its owning context; `notify_failure` reports a typed failure code.
pub trait Downstream: Send + Sync {
    fn upload(
        &self,
        device_id: &str,
        artifact_name: &str,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<String, DownstreamError>> + Send;

    fn notify_complete(
        &self,
        device_id: &str,
        artifact_name: &str,
        location: &str,
    ) -> impl Future<Output = Result<(), DownstreamError>> + Send;

    fn notify_failure(
        &self,
        device_id: &str,
        artifact_name: &str,
        code: &str,
        message: &str,
    ) -> impl Future<Output = Result<(), DownstreamError>> + Send;
}

/// HTTP downstream client.  Each call is bounded by the configured timeout.
pub struct HttpDownstream {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    location: String,
}

impl HttpDownstream {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DownstreamError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DownstreamError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }
}

impl Downstream for HttpDownstream {
    async fn upload(
        &self,
        device_id: &str,
        artifact_name: &str,
        bytes: Vec<u8>,
    ) -> Result<String, DownstreamError> {
        let url = format!("{}/v1/artifacts/{}/{}", self.base_url, device_id, artifact_name);
        let response = self
            .client
            .put(&url)
            .header("content-type", "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| DownstreamError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DownstreamError::Request(format!(
                "PUT {} returned {}",
                url,
                response.status()
            )));
        }
        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| DownstreamError::Invalid(e.to_string()))?;
        Ok(body.location)
    }

    async fn notify_complete(
        &self,
        device_id: &str,
        artifact_name: &str,
        location: &str,
    ) -> Result<(), DownstreamError> {
        let url = format!("{}/v1/captures", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "device_id": device_id,
                "artifact_name": artifact_name,
                "location": location,
            }))
            .send()
            .await
            .map_err(|e| DownstreamError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DownstreamError::Request(format!(
                "POST {} returned {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }

    async fn notify_failure(
        &self,
        device_id: &str,
        artifact_name: &str,
        code: &str,
        message: &str,
    ) -> Result<(), DownstreamError> {
        let url = format!("{}/v1/failures", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "device_id": device_id,
                "artifact_name": artifact_name,
                "code": code,
                "message": message,
            }))
            .send()
            .await
            .map_err(|e| DownstreamError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DownstreamError::Request(format!(
                "POST {} returned {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }
}
