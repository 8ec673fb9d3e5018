use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::core::config::PublisherConfig;
use crate::core::errors::{PublishError, PublishResult};
use crate::core::types::TargetLanguage;
use crate::utils::{EncodedFormat, Metrics};

/// Where a rendered page lands in object storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishTarget {
    pub chapter_id: i64,
    pub page_id: i64,
    pub language: TargetLanguage,
}

impl PublishTarget {
    /// `translations/{chapter_id}/{page_id}-{language}.{ext}`
    pub fn object_path(&self, extension: &str) -> String {
        format!(
            "translations/{}/{}-{}.{}",
            self.chapter_id,
            self.page_id,
            self.language.code(),
            extension
        )
    }
}

/// Uploads a rendered page and returns its public URL
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish(&self, rendered: &[u8], target: &PublishTarget) -> PublishResult<String>;
}

/// Build the publisher selected by configuration
pub fn from_config(
    config: &PublisherConfig,
    metrics: Option<Metrics>,
) -> reqwest::Result<Box<dyn ResultPublisher>> {
    let publisher: Box<dyn ResultPublisher> = match config {
        PublisherConfig::Local {
            root_dir,
            public_base_url,
        } => Box::new(
            LocalPublisher::new(root_dir.clone(), public_base_url.clone()).with_metrics(metrics),
        ),
        PublisherConfig::Http {
            endpoint,
            bucket,
            public_base_url,
            token,
            timeout,
        } => Box::new(
            HttpPublisher::new(
                endpoint.clone(),
                bucket.clone(),
                public_base_url.clone(),
                token.clone(),
                *timeout,
            )?
            .with_metrics(metrics),
        ),
    };
    Ok(publisher)
}

fn public_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

fn sniff_extension(rendered: &[u8]) -> PublishResult<&'static str> {
    EncodedFormat::sniff(rendered)
        .map(|format| format.extension())
        .ok_or(PublishError::UnknownFormat)
}

/// Writes pages under a local directory served by some static file host
pub struct LocalPublisher {
    root_dir: PathBuf,
    public_base_url: String,
    metrics: Option<Metrics>,
}

impl LocalPublisher {
    pub fn new(root_dir: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root_dir: root_dir.into(),
            public_base_url: public_base_url.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    async fn write_atomically(&self, path: &str, rendered: &[u8]) -> PublishResult<()> {
        let final_path = self.root_dir.join(path);
        let io_error = |source| PublishError::Io {
            path: final_path.display().to_string(),
            source,
        };

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        // Readers never see a half-written page
        let temp_path = final_path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        if let Err(source) = tokio::fs::write(&temp_path, rendered).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(io_error(source));
        }
        if let Err(source) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(io_error(source));
        }
        Ok(())
    }
}

#[async_trait]
impl ResultPublisher for LocalPublisher {
    #[instrument(skip(self, rendered), fields(bytes = rendered.len()))]
    async fn publish(&self, rendered: &[u8], target: &PublishTarget) -> PublishResult<String> {
        let start = Instant::now();
        let path = target.object_path(sniff_extension(rendered)?);

        self.write_atomically(&path, rendered).await?;

        if let Some(ref m) = self.metrics {
            m.record_publish(start.elapsed());
        }
        let url = public_url(&self.public_base_url, &path);
        debug!("Published {} to {}", path, url);
        Ok(url)
    }
}

/// PUTs pages to an S3-style object storage endpoint
pub struct HttpPublisher {
    endpoint: String,
    bucket: String,
    public_base_url: String,
    token: Option<String>,
    http_client: reqwest::Client,
    metrics: Option<Metrics>,
}

impl HttpPublisher {
    pub fn new(
        endpoint: String,
        bucket: String,
        public_base_url: String,
        token: Option<String>,
        timeout: Duration,
    ) -> reqwest::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            endpoint,
            bucket,
            public_base_url,
            token,
            http_client,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Option<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    fn upload_url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.bucket.trim_matches('/'),
            path
        )
    }
}

#[async_trait]
impl ResultPublisher for HttpPublisher {
    #[instrument(skip(self, rendered), fields(bytes = rendered.len()))]
    async fn publish(&self, rendered: &[u8], target: &PublishTarget) -> PublishResult<String> {
        let start = Instant::now();
        let format = EncodedFormat::sniff(rendered).ok_or(PublishError::UnknownFormat)?;
        let path = target.object_path(format.extension());
        let url = self.upload_url(&path);

        let mut request = self
            .http_client
            .put(&url)
            .header(CONTENT_TYPE, format.mime_type())
            .body(rendered.to_vec());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|source| PublishError::Request {
            url: url.clone(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Status {
                url,
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        if let Some(ref m) = self.metrics {
            m.record_publish(start.elapsed());
        }
        info!("Uploaded {} ({} bytes)", path, rendered.len());
        Ok(public_url(&self.public_base_url, &path))
    }
}
