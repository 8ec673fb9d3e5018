// Library exports for the per-page manga translation pipeline

// Core modules
pub mod api;
pub mod core;
pub mod middleware;
pub mod orchestration;
pub mod services;
pub mod store;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    config::Config,
    errors::{ErrorKind, PipelineError, PipelineResult},
    types::{PageStatus, SourcePage, TargetLanguage, TranslationOutcome, TranslationProfile},
};

pub use middleware::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

pub use orchestration::{ClaimReconciler, PipelineComponents, TranslationOrchestrator};

pub use services::{HttpImageFetcher, LocalPublisher, TranslationClient};

pub use store::{MemoryPageStore, PageStore, SqlitePageStore};

pub use utils::Metrics;
