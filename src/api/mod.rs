// HTTP surface: translation requests, status lookups and monitoring

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::core::errors::{PipelineError, TranslationError};
use crate::core::types::TranslationOutcome;
use crate::middleware::CircuitBreaker;
use crate::orchestration::TranslationOrchestrator;
use crate::utils::Metrics;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TranslationOrchestrator>,
    pub metrics: Metrics,
    pub circuit_breaker: Option<CircuitBreaker>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route(
            "/pages/:page_id/translations/:language",
            get(translation_status).post(request_translation),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn root() -> &'static str {
    "Manga Page Translator"
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "metrics": state.metrics.snapshot(),
        "circuit_breaker": state.circuit_breaker.as_ref().map(|cb| cb.stats()),
        "available_job_slots": state.orchestrator.available_permits(),
    }))
}

/// Ensure a translation exists.
///
/// - 200 with the image URL when it is (or just became) available
/// - 202 while another job is rendering the page
async fn request_translation(
    State(state): State<AppState>,
    Path((page_id, language)): Path<(i64, String)>,
) -> Result<Response, PipelineError> {
    state
        .metrics
        .record_endpoint_request("POST /pages/:page_id/translations/:language");

    let response = match state
        .orchestrator
        .request_translation(page_id, &language)
        .await?
    {
        outcome @ TranslationOutcome::Completed { .. } => {
            (StatusCode::OK, Json(outcome)).into_response()
        }
        TranslationOutcome::Accepted => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "processing" })),
        )
            .into_response(),
    };
    Ok(response)
}

async fn translation_status(
    State(state): State<AppState>,
    Path((page_id, language)): Path<(i64, String)>,
) -> Result<Response, PipelineError> {
    state
        .metrics
        .record_endpoint_request("GET /pages/:page_id/translations/:language");

    let status = state
        .orchestrator
        .translation_status(page_id, &language)
        .await?;
    Ok(Json(status).into_response())
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = match &self {
            PipelineError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Upstream(TranslationError::CircuitOpen) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PipelineError::SourceFetch(_)
            | PipelineError::Upstream(_)
            | PipelineError::Storage(_) => StatusCode::BAD_GATEWAY,
            PipelineError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PipelineError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        };

        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!("Request failed: {}", self);
        }

        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind().as_str(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{FetchError, PublishError, StoreError};
    use std::time::Duration;

    #[test]
    fn test_error_status_codes() {
        let cases = [
            (PipelineError::InvalidArgument("fr".into()), StatusCode::BAD_REQUEST),
            (PipelineError::NotFound(9), StatusCode::NOT_FOUND),
            (
                PipelineError::SourceFetch(FetchError::Empty("x".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (
                PipelineError::Upstream(TranslationError::MalformedResponse("x".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (
                PipelineError::Upstream(TranslationError::CircuitOpen),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                PipelineError::TimedOut(Duration::from_secs(1)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                PipelineError::Storage(PublishError::UnknownFormat),
                StatusCode::BAD_GATEWAY,
            ),
            (
                PipelineError::Store(StoreError::CorruptRow {
                    key: "k".into(),
                    reason: "r".into(),
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (PipelineError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
