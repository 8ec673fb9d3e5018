pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::{Config, PublisherConfig};
pub use errors::{
    ConfigError, ErrorKind, FetchError, PipelineError, PipelineResult, PublishError, StoreError,
    TranslationError,
};
pub use types::{
    ClaimToken, Finalization, PageKey, PageStatus, SourcePage, TargetLanguage, TranslatedPage,
    TranslationOutcome, TranslationProfile, TranslationState,
};
