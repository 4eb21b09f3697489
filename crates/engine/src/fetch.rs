use crate::error::{EngineError, Result};
use async_trait::async_trait;
use image::DynamicImage;
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;

/// Downloads attachment bytes.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Fetch and decode, off the async runtime for the decode step.
pub async fn fetch_image(fetcher: &dyn ImageFetcher, url: &str) -> Result<DynamicImage> {
    let bytes = fetcher.fetch(url).await?;
    let image = tokio::task::spawn_blocking(move || sentinel_vision::corpus::decode_bytes(&bytes))
        .await
        .map_err(|e| EngineError::Fetch(format!("decode task failed: {e}")))??;
    Ok(image)
}

/// `http(s)://` over reqwest. `file://` URLs and bare paths are read from the local disk only
/// when [`HttpImageFetcher::allow_local_files`] is set.
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: Client,
    max_bytes: u64,
    local_files: bool,
}

impl HttpImageFetcher {
    pub fn new(max_bytes: u64, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            max_bytes,
            local_files: false,
        })
    }

    #[must_use]
    pub fn allow_local_files(mut self, allow: bool) -> Self {
        self.local_files = allow;
        self
    }

    async fn fetch_remote(&self, url: &str) -> Result<Vec<u8>> {
        let mut response = self.client.get(url).send().await?.error_for_status()?;
        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(EngineError::Fetch(format!(
                    "{url}: {len} bytes exceeds limit of {}",
                    self.max_bytes
                )));
            }
        }
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            body.extend_from_slice(&chunk);
            if body.len() as u64 > self.max_bytes {
                return Err(EngineError::Fetch(format!(
                    "{url}: body exceeds limit of {} bytes",
                    self.max_bytes
                )));
            }
        }
        Ok(body)
    }

    async fn fetch_local(&self, path: PathBuf) -> Result<Vec<u8>> {
        let meta = tokio::fs::metadata(&path).await?;
        if meta.len() > self.max_bytes {
            return Err(EngineError::Fetch(format!(
                "{}: {} bytes exceeds limit of {}",
                path.display(),
                meta.len(),
                self.max_bytes
            )));
        }
        Ok(tokio::fs::read(&path).await?)
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return self.fetch_remote(url).await;
        }
        if !self.local_files {
            return Err(EngineError::Fetch(format!(
                "{url}: not an http(s) URL and local files are disabled"
            )));
        }
        let path = url.strip_prefix("file://").unwrap_or(url);
        self.fetch_local(PathBuf::from(path)).await
    }
}
