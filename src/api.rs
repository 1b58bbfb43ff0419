//! Resource fetching
//!
//! Transcripts, lesson indexes and (for the seek fallback) whole audio files
//! are retrieved through the `Fetcher` trait so the engine never depends on
//! a concrete transport.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;

use crate::error::FetchError;

/// Retrieves remote or local resources by URL
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the full body as bytes
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;

    /// Fetch the full body as UTF-8 text
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let bytes = self.fetch_bytes(url).await?;
        String::from_utf8(bytes).map_err(|_| FetchError::Encoding(url.to_string()))
    }
}

/// Fetch and decode a JSON document
pub async fn fetch_json<T: DeserializeOwned>(fetcher: &dyn Fetcher, url: &str) -> Result<T, FetchError> {
    let bytes = fetcher.fetch_bytes(url).await?;
    serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}

const TIMEOUT: u64 = 60;

/// HTTP(S) via reqwest, anything else read from the local filesystem
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_timeout(Duration::from_secs(TIMEOUT))
    }

    /// Requests (including the body download) fail after `timeout`
    pub fn with_timeout(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { client })
    }

    fn is_remote(url: &str) -> bool {
        url.starts_with("http://") || url.starts_with("https://")
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if !Self::is_remote(url) {
            let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
            return tokio::fs::read(&path)
                .await
                .map_err(|source| FetchError::Io { path, source });
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Http {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await.map_err(|source| FetchError::Http {
            url: url.to_string(),
            source,
        })?;
        tracing::debug!("Fetched {} ({} bytes)", url, body.len());
        Ok(body.to_vec())
    }
}

/// In-memory resources keyed by URL
///
/// Used for simulation and tests; fetches of unknown URLs fail with
/// `FetchError::NotFound`.
#[derive(Debug, Clone, Default)]
pub struct MemoryFetcher {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.entries.write().insert(url.into(), body.into());
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.entries
            .read()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(url.to_string()))
    }
}
