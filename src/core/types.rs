// Domain types for the per-page translation pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Supported target languages (closed set, validated before any work)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetLanguage {
    #[serde(rename = "en")]
    English,
    #[serde(rename = "vi")]
    Vietnamese,
}

impl TargetLanguage {
    pub const ALL: [TargetLanguage; 2] = [TargetLanguage::English, TargetLanguage::Vietnamese];

    /// Code used in our own keys, URLs and storage paths
    pub fn code(&self) -> &'static str {
        match self {
            TargetLanguage::English => "en",
            TargetLanguage::Vietnamese => "vi",
        }
    }

    /// Code understood by the translation service
    pub fn service_code(&self) -> &'static str {
        match self {
            TargetLanguage::English => "ENG",
            TargetLanguage::Vietnamese => "VIN",
        }
    }
}

impl fmt::Display for TargetLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for TargetLanguage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "en" => Ok(TargetLanguage::English),
            "vi" => Ok(TargetLanguage::Vietnamese),
            _ => Err(format!("Unsupported target language: {}", s)),
        }
    }
}

/// Untranslated page owned by the ingestion side (read-only here)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePage {
    pub page_id: i64,
    pub chapter_id: i64,
    pub page_number: i32,
    pub image_location: String,
    /// Source language of the page, e.g. "ja"
    pub language: String,
}

/// Natural key of a translation variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageKey {
    pub chapter_id: i64,
    pub page_number: i32,
    pub language: TargetLanguage,
}

impl PageKey {
    pub fn new(chapter_id: i64, page_number: i32, language: TargetLanguage) -> Self {
        Self {
            chapter_id,
            page_number,
            language,
        }
    }

    pub fn for_source(source: &SourcePage, language: TargetLanguage) -> Self {
        Self::new(source.chapter_id, source.page_number, language)
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chapter {} page {} [{}]",
            self.chapter_id, self.page_number, self.language
        )
    }
}

/// Stored state of a translation variant.
///
/// Kept apart from the image URL so an in-flight job can never be confused
/// with a resolved location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslationState {
    NotTranslated,
    Processing {
        claim_id: Uuid,
        lease_expires_at: DateTime<Utc>,
    },
    Translated {
        image_url: String,
    },
}

/// Coarse status derived from [`TranslationState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    NotTranslated,
    Processing,
    Translated,
}

impl PageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageStatus::NotTranslated => "not_translated",
            PageStatus::Processing => "processing",
            PageStatus::Translated => "translated",
        }
    }
}

/// One row per (chapter, page number, language)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedPage {
    pub key: PageKey,
    pub state: TranslationState,
    pub updated_at: DateTime<Utc>,
}

impl TranslatedPage {
    /// Status as seen at `now`. A processing row whose lease has run out
    /// belongs to a dead job and reads as not translated.
    pub fn status_at(&self, now: DateTime<Utc>) -> PageStatus {
        match &self.state {
            TranslationState::NotTranslated => PageStatus::NotTranslated,
            TranslationState::Processing {
                lease_expires_at, ..
            } if *lease_expires_at <= now => PageStatus::NotTranslated,
            TranslationState::Processing { .. } => PageStatus::Processing,
            TranslationState::Translated { .. } => PageStatus::Translated,
        }
    }

    pub fn status(&self) -> PageStatus {
        self.status_at(Utc::now())
    }

    pub fn image_url(&self) -> Option<&str> {
        match &self.state {
            TranslationState::Translated { image_url } => Some(image_url),
            _ => None,
        }
    }
}

/// Proof of an exclusive processing claim on a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    pub key: PageKey,
    pub claim_id: Uuid,
    pub lease_expires_at: DateTime<Utc>,
}

/// How a claimed job ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalization {
    Translated { image_url: String },
    Rollback,
}

/// Successful result of a translation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TranslationOutcome {
    /// The page has a rendered translation. `cached` is true when it already
    /// existed and no work was done.
    Completed { image_url: String, cached: bool },
    /// Another job holds the claim for this key
    Accepted,
}

impl TranslationOutcome {
    pub fn image_url(&self) -> Option<&str> {
        match self {
            TranslationOutcome::Completed { image_url, .. } => Some(image_url),
            TranslationOutcome::Accepted => None,
        }
    }
}

/// Fixed per-deployment configuration of the external translation pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationProfile {
    pub detector: String,
    pub ocr: String,
    pub translator: String,
    pub inpainter: String,
    pub inpainting_size: u32,
    /// Starting font size for re-rendered text
    pub font_size: u32,
    /// Renderer never shrinks text below this
    pub font_size_minimum: u32,
    /// Expansion applied to detected text boxes
    pub box_expansion_ratio: f32,
    pub include_inpainted: bool,
    pub render_text: bool,
}

impl Default for TranslationProfile {
    fn default() -> Self {
        Self {
            detector: "default".to_string(),
            ocr: "48px".to_string(),
            translator: "gemini".to_string(),
            inpainter: "lama_large".to_string(),
            inpainting_size: 2048,
            font_size: 28,
            font_size_minimum: 12,
            box_expansion_ratio: 2.3,
            include_inpainted: true,
            render_text: true,
        }
    }
}
