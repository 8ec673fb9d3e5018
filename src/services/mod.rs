pub mod fetcher;
pub mod publisher;
pub mod translation;

// Re-export commonly used services
pub use fetcher::{HttpImageFetcher, ImageFetcher};
pub use publisher::{HttpPublisher, LocalPublisher, PublishTarget, ResultPublisher};
pub use translation::{PageTranslator, TranslationClient};
