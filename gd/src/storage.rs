//! Object storage collaborator
//!
//! Generated assets live at short-lived provider URLs; each successful task
//! gets re-uploaded once to durable storage and referenced by a stable CDN
//! URL from then on.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::StorageConfig;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Source fetch failed with HTTP {0}")]
    SourceFetch(u16),

    #[error("Upload failed with HTTP {0}: {1}")]
    Upload(u16, String),
}

/// Durable blob store reachable over HTTP
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Fetch `source_url` and persist it under `key`, returning the stable
    /// CDN URL of the stored object
    async fn upload_from_url(&self, source_url: &str, key: &str) -> Result<String, StorageError>;
}

/// Storage client speaking plain HTTP GET/PUT
pub struct HttpObjectStorage {
    endpoint: String,
    bucket: String,
    cdn_base_url: String,
    auth_token: Option<String>,
    http: Client,
}

impl HttpObjectStorage {
    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        debug!(?config.endpoint, ?config.bucket, "from_config: called");
        let auth_token = config
            .auth_token_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok());

        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(StorageError::Network)?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            cdn_base_url: config.cdn_base_url.trim_end_matches('/').to_string(),
            auth_token,
            http,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    fn cdn_url(&self, key: &str) -> String {
        format!("{}/{}", self.cdn_base_url, key)
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn upload_from_url(&self, source_url: &str, key: &str) -> Result<String, StorageError> {
        debug!(%source_url, %key, "upload_from_url: called");

        let response = self.http.get(source_url).send().await?;
        if !response.status().is_success() {
            debug!(status = response.status().as_u16(), "upload_from_url: source fetch failed");
            return Err(StorageError::SourceFetch(response.status().as_u16()));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let bytes = response.bytes().await?;

        let mut request = self
            .http
            .put(self.object_url(key))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            debug!(status, "upload_from_url: upload failed");
            return Err(StorageError::Upload(status, text));
        }

        let cdn_url = self.cdn_url(key);
        info!(%key, %cdn_url, "upload_from_url: stored");
        Ok(cdn_url)
    }
}
