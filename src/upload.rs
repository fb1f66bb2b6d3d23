//! JSON upload to content-addressed storage
//!
//! Proof source documents are pinned through the Lighthouse API and
//! addressed by their public gateway URL.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::CollaboratorError;

pub const LIGHTHOUSE_API_URL: &str = "https://node.lighthouse.storage";
pub const LIGHTHOUSE_GATEWAY_URL: &str = "https://gateway.lighthouse.storage";
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Stores a JSON document and returns a URL it can be fetched from.
#[async_trait]
pub trait JsonUploader: Send + Sync {
    async fn store(&self, data: &serde_json::Value) -> Result<String, CollaboratorError>;
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

pub struct LighthouseUploader {
    client: reqwest::Client,
    api_url: String,
    gateway_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl LighthouseUploader {
    pub fn new(
        api_url: impl Into<String>,
        gateway_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client: http_client(DEFAULT_UPLOAD_TIMEOUT),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            gateway_url: gateway_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            timeout: DEFAULT_UPLOAD_TIMEOUT,
        }
    }

    /// Bound every upload request, response body included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self.timeout = timeout;
        self
    }

    fn transport_error(&self, e: reqwest::Error) -> CollaboratorError {
        if e.is_timeout() {
            CollaboratorError::Timeout("upload", self.timeout)
        } else {
            e.into()
        }
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

#[async_trait]
impl JsonUploader for LighthouseUploader {
    async fn store(&self, data: &serde_json::Value) -> Result<String, CollaboratorError> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            CollaboratorError::Config("Lighthouse API key is not configured".to_string())
        })?;

        // Pretty printed with 2-space indentation and \n line endings
        let content = serde_json::to_string_pretty(data)
            .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))?;
        let file_name = format!("{}.json", Uuid::new_v4());
        let part = Part::bytes(content.into_bytes())
            .file_name(file_name.clone())
            .mime_str("application/json")?;
        let form = Form::new().part("file", part);

        debug!("Uploading {} to Lighthouse", file_name);
        let response = self
            .client
            .post(format!("{}/api/v0/add", self.api_url))
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Http {
                service: "lighthouse",
                status,
                body,
            });
        }

        let added: AddResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;
        if added.hash.is_empty() {
            return Err(CollaboratorError::InvalidResponse(
                "Lighthouse returned an empty CID".to_string(),
            ));
        }

        let url = format!("{}/ipfs/{}", self.gateway_url, added.hash);
        info!("Uploaded {} as {}", file_name, url);
        Ok(url)
    }
}
