use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::core::config::FetcherConfig;
use crate::core::errors::{FetchError, FetchResult};

/// Retrieves the encoded bytes of a source page image
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, location: &str) -> FetchResult<Vec<u8>>;
}

/// Fetches `http(s)://` locations over the network and `file://` URLs or
/// bare paths from local disk. No retries.
pub struct HttpImageFetcher {
    http_client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new(config: &FetcherConfig) -> reqwest::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self { http_client })
    }

    async fn fetch_remote(&self, location: &str) -> FetchResult<Vec<u8>> {
        let request_error = |source| FetchError::Request {
            location: location.to_string(),
            source,
        };

        let response = self
            .http_client
            .get(location)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                location: location.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(request_error)?;
        Ok(bytes.to_vec())
    }

    async fn fetch_local(path: &str) -> FetchResult<Vec<u8>> {
        tokio::fs::read(path).await.map_err(|source| FetchError::Io {
            path: path.to_string(),
            source,
        })
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, location: &str) -> FetchResult<Vec<u8>> {
        let bytes = if location.starts_with("http://") || location.starts_with("https://") {
            self.fetch_remote(location).await?
        } else if let Some(path) = location.strip_prefix("file://") {
            Self::fetch_local(path).await?
        } else if location.contains("://") || location.trim().is_empty() {
            return Err(FetchError::UnsupportedLocation(location.to_string()));
        } else {
            Self::fetch_local(location).await?
        };

        if bytes.is_empty() {
            return Err(FetchError::Empty(location.to_string()));
        }

        debug!("Fetched {} bytes", bytes.len());
        Ok(bytes)
    }
}
