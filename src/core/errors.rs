// Error types for the translation job pipeline
//
// One thiserror enum per collaborator, folded into PipelineError at the
// orchestrator boundary. PipelineError::kind() gives the caller-facing
// category used by the HTTP layer and metrics.

use std::time::Duration;
use thiserror::Error;

/// Source image retrieval errors
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request for {location} failed: {source}")]
    Request {
        location: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Source image at {location} returned status {status}")]
    Status { location: String, status: u16 },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Source image at {0} is empty")]
    Empty(String),

    #[error("Unsupported image location: {0}")]
    UnsupportedLocation(String),
}

/// Translation service errors
#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("Translation service request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Translation service rejected the page (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed translation response: {0}")]
    MalformedResponse(String),

    #[error("Circuit breaker is open, translation service unavailable")]
    CircuitOpen,
}

/// Object storage errors
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Upload to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Upload to {url} returned status {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("Failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Rendered output is not a recognised image format")]
    UnknownFormat,
}

/// Page store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt row for {key}: {reason}")]
    CorruptRow { key: String, reason: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("Unknown publisher backend '{0}' (expected 'local' or 'http')")]
    UnknownPublisherBackend(String),

    #[error("Claim lease ({lease:?}) must exceed job timeout ({job_timeout:?})")]
    LeaseTooShort {
        lease: Duration,
        job_timeout: Duration,
    },
}

/// Caller-facing error category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    UpstreamFailure,
    StorageFailure,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::UpstreamFailure => "upstream_failure",
            ErrorKind::StorageFailure => "storage_failure",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Orchestrator errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unsupported target language: {0}")]
    InvalidArgument(String),

    #[error("Source page {0} not found")]
    NotFound(i64),

    #[error("Failed to fetch source image: {0}")]
    SourceFetch(#[from] FetchError),

    #[error("{0}")]
    Upstream(#[from] TranslationError),

    #[error("Translation job exceeded {0:?}")]
    TimedOut(Duration),

    #[error("Publishing rendered page failed: {0}")]
    Storage(#[from] PublishError),

    #[error("Page store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Job pool is shutting down")]
    ShuttingDown,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            PipelineError::NotFound(_) => ErrorKind::NotFound,
            PipelineError::SourceFetch(_)
            | PipelineError::Upstream(_)
            | PipelineError::TimedOut(_) => ErrorKind::UpstreamFailure,
            PipelineError::Storage(_) => ErrorKind::StorageFailure,
            PipelineError::Store(_) | PipelineError::ShuttingDown => ErrorKind::Internal,
        }
    }
}

pub type FetchResult<T> = Result<T, FetchError>;
pub type TranslationResult<T> = Result<T, TranslationError>;
pub type PublishResult<T> = Result<T, PublishError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type PipelineResult<T> = Result<T, PipelineError>;
