use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use reqwest::multipart::{Form, Part};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::core::config::TranslatorConfig;
use crate::core::errors::{TranslationError, TranslationResult};
use crate::core::types::{TargetLanguage, TranslationProfile};
use crate::middleware::circuit_breaker::CircuitBreaker;
use crate::utils::{mime_type_for, EncodedFormat, Metrics};

/// Response field carrying the final rendered page
const RENDERED_IMAGE_FIELD: &str = "rendered_image";

/// Fields the service uses for business-level failure messages, in order of preference
const MESSAGE_FIELDS: [&str; 3] = ["message", "detail", "error"];

/// Turns a source page into a rendered, translated page
#[async_trait]
pub trait PageTranslator: Send + Sync {
    async fn translate(
        &self,
        image: &[u8],
        source_language: &str,
        target_language: TargetLanguage,
        profile: &TranslationProfile,
    ) -> TranslationResult<Vec<u8>>;
}

/// HTTP client for the external image translation service, with circuit
/// breaker, a long timeout and metrics.
pub struct TranslationClient {
    endpoint: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
    circuit_breaker: CircuitBreaker,
    metrics: Option<Metrics>,
}

impl TranslationClient {
    pub fn new(
        config: &TranslatorConfig,
        circuit_breaker: Option<CircuitBreaker>,
        metrics: Option<Metrics>,
    ) -> reqwest::Result<Self> {
        // Detection, OCR, translation, inpainting and rendering all happen in
        // one call, so the timeout is measured in minutes
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            http_client,
            circuit_breaker: circuit_breaker.unwrap_or_default(),
            metrics,
        })
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    fn build_form(
        image: &[u8],
        source_language: &str,
        target_language: TargetLanguage,
        profile: &TranslationProfile,
    ) -> TranslationResult<Form> {
        let format = EncodedFormat::sniff(image);
        let part = Part::bytes(image.to_vec())
            .file_name(format!(
                "page.{}",
                format.map(|f| f.extension()).unwrap_or("png")
            ))
            .mime_str(mime_type_for(image))?;

        Ok(Form::new()
            .part("image", part)
            .text("source_lang", source_language.to_string())
            .text("target_lang", target_language.service_code())
            .text("detector", profile.detector.clone())
            .text("ocr", profile.ocr.clone())
            .text("translator", profile.translator.clone())
            .text("inpainter", profile.inpainter.clone())
            .text("inpainting_size", profile.inpainting_size.to_string())
            .text("font_size", profile.font_size.to_string())
            .text("font_size_minimum", profile.font_size_minimum.to_string())
            .text("unclip_ratio", profile.box_expansion_ratio.to_string())
            .text("include_inpainted", profile.include_inpainted.to_string())
            .text("render_text", profile.render_text.to_string()))
    }

    async fn send(&self, form: Form) -> TranslationResult<Vec<u8>> {
        let mut request = self.http_client.post(&self.endpoint).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;

        extract_rendered_image(status, &body)
    }

    fn record_outcome(&self, result: &TranslationResult<Vec<u8>>, duration: Duration) {
        // A page the service answered but declined (e.g. no text found)
        // says nothing about service health
        let service_fault = match result {
            Ok(_) => false,
            Err(TranslationError::Rejected { status, .. }) => *status >= 500,
            Err(_) => true,
        };

        if service_fault {
            if self.circuit_breaker.record_failure() {
                warn!("Translation service circuit opened");
                if let Some(ref m) = self.metrics {
                    m.record_circuit_breaker_trip();
                }
            }
        } else {
            self.circuit_breaker.record_success();
        }

        if let Some(ref m) = self.metrics {
            m.record_upstream_call(result.is_ok(), duration);
        }
    }
}

#[async_trait]
impl PageTranslator for TranslationClient {
    #[instrument(skip(self, image, profile), fields(image_bytes = image.len()))]
    async fn translate(
        &self,
        image: &[u8],
        source_language: &str,
        target_language: TargetLanguage,
        profile: &TranslationProfile,
    ) -> TranslationResult<Vec<u8>> {
        if !self.circuit_breaker.allow_request() {
            warn!("Circuit breaker is open, failing fast");
            return Err(TranslationError::CircuitOpen);
        }
        let admission = Admission::new(&self.circuit_breaker);

        let form = Self::build_form(image, source_language, target_language, profile)?;

        let start = Instant::now();
        let result = self.send(form).await;
        let duration = start.elapsed();
        self.record_outcome(&result, duration);
        admission.settle();

        match &result {
            Ok(rendered) => debug!(
                "Rendered page received ({} bytes) in {:.1}s",
                rendered.len(),
                duration.as_secs_f64()
            ),
            Err(e) => warn!("Translation failed after {:.1}s: {}", duration.as_secs_f64(), e),
        }

        result
    }
}

/// A call the breaker let through. Dropped unsettled (future cancelled, form
/// build failed) it hands the probe slot back.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl<'a> Admission<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            settled: false,
        }
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!("Translation call abandoned before an outcome was recorded");
            self.breaker.abandon_probe();
        }
    }
}

/// Pull the rendered page out of a service response.
///
/// Success is decided by the presence of the rendered image field, not by
/// the HTTP status: the service reports some failures with a 2xx status and
/// a message in the body.
pub fn extract_rendered_image(status: u16, body: &[u8]) -> TranslationResult<Vec<u8>> {
    let payload: serde_json::Value = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(e) if (200..300).contains(&status) => {
            return Err(TranslationError::MalformedResponse(format!(
                "response is not JSON: {}",
                e
            )))
        }
        Err(_) => {
            return Err(TranslationError::Rejected {
                status,
                message: snippet(body),
            })
        }
    };

    let rendered = payload
        .get(RENDERED_IMAGE_FIELD)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let Some(encoded) = rendered else {
        let message = MESSAGE_FIELDS
            .iter()
            .find_map(|field| match payload.get(*field)? {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) if s.trim().is_empty() => None,
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
            .unwrap_or_else(|| {
                format!("response has no {} field (HTTP {})", RENDERED_IMAGE_FIELD, status)
            });
        return Err(TranslationError::Rejected { status, message });
    };

    // Accept both bare base64 and data URLs
    let encoded = match encoded.strip_prefix("data:") {
        Some(data_url) => data_url
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| TranslationError::MalformedResponse("data URL without payload".into()))?,
        None => encoded,
    };

    let bytes = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| TranslationError::MalformedResponse(format!("invalid base64: {}", e)))?;

    if EncodedFormat::sniff(&bytes).is_none() {
        return Err(TranslationError::MalformedResponse(format!(
            "{} is not a PNG, JPEG or WebP image",
            RENDERED_IMAGE_FIELD
        )));
    }

    Ok(bytes)
}

fn snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return "empty response body".to_string();
    }
    text.chars().take(200).collect()
}
