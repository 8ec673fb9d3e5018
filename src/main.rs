// Main entry point for the page translation service

use page_translator::{
    api::{self, AppState},
    core::Config,
    middleware::CircuitBreaker,
    orchestration::{ClaimReconciler, PipelineComponents, TranslationOrchestrator},
    services::{publisher, HttpImageFetcher, TranslationClient},
    store::{MemoryPageStore, PageStore, SourcePageProvider, SqlitePageStore},
    utils::Metrics,
};

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::new().context("Failed to load configuration")?;

    // Initialize logging
    let level = config.log_level().as_str().to_lowercase();
    let filter = EnvFilter::new(format!(
        "page_translator={level},page_translator_server={level},tower_http={level}"
    ));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== MANGA PAGE TRANSLATOR ===");
    info!(
        "Config: jobs={} timeout={}s lease={}s translator={}",
        config.jobs.max_concurrent_jobs,
        config.jobs.job_timeout.as_secs(),
        config.jobs.claim_lease.as_secs(),
        config.translator.endpoint
    );

    let metrics = Metrics::new();
    let (store, sources) = open_stores(&config).await?;

    let circuit_breaker = CircuitBreaker::with_config(config.circuit_breaker.clone());
    let translator = TranslationClient::new(
        &config.translator,
        Some(circuit_breaker.clone()),
        Some(metrics.clone()),
    )
    .context("Failed to build translation client")?;
    let fetcher =
        HttpImageFetcher::new(&config.fetcher).context("Failed to build image fetcher")?;
    let publisher = publisher::from_config(&config.publisher, Some(metrics.clone()))
        .context("Failed to build publisher")?;

    let orchestrator = Arc::new(TranslationOrchestrator::new(
        PipelineComponents {
            store: Arc::clone(&store),
            sources,
            fetcher: Arc::new(fetcher),
            translator: Arc::new(translator),
            publisher: Arc::from(publisher),
        },
        config.profile.clone(),
        &config.jobs,
        metrics.clone(),
    ));

    let reconciler =
        ClaimReconciler::new(store, metrics.clone(), config.jobs.reconcile_interval).spawn();

    let app = api::router(AppState {
        orchestrator: Arc::clone(&orchestrator),
        metrics,
        circuit_breaker: Some(circuit_breaker),
    });

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /                                       - Root endpoint");
    info!("  GET  /health                                 - Health check");
    info!("  GET  /metrics                                - Prometheus metrics");
    info!("  GET  /stats                                  - Detailed statistics");
    info!("  POST /pages/:page_id/translations/:language  - Request a translation");
    info!("  GET  /pages/:page_id/translations/:language  - Translation status");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    orchestrator.shutdown();
    reconciler.abort();

    Ok(())
}

async fn open_stores(
    config: &Config,
) -> Result<(Arc<dyn PageStore>, Arc<dyn SourcePageProvider>)> {
    if config.database.is_memory() {
        info!("Using in-memory page store");
        let store = Arc::new(MemoryPageStore::new());
        let page_store: Arc<dyn PageStore> = store.clone();
        return Ok((page_store, store));
    }

    info!("Opening page store at {}", config.database.url);
    let store = Arc::new(
        SqlitePageStore::connect(&config.database.url, config.database.max_connections)
            .await
            .context("Failed to open page store")?,
    );
    let page_store: Arc<dyn PageStore> = store.clone();
    Ok((page_store, store))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
