pub mod api_client;

pub use api_client::{extract_rendered_image, PageTranslator, TranslationClient};
