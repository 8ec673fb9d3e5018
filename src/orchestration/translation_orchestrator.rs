// Translation Orchestrator: per-page job coordinator
//
// Resolves the source page, answers cached and in-flight requests without
// work, and otherwise claims the key, runs fetch -> translate -> publish
// under a job permit and a whole-job deadline, and finalizes the row.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::core::config::JobConfig;
use crate::core::errors::{PipelineError, PipelineResult, StoreResult};
use crate::core::types::{
    ClaimToken, Finalization, PageKey, PageStatus, SourcePage, TargetLanguage,
    TranslationOutcome, TranslationProfile,
};
use crate::services::{ImageFetcher, PageTranslator, PublishTarget, ResultPublisher};
use crate::store::{PageStore, SourcePageProvider};
use crate::utils::Metrics;

/// Collaborators the orchestrator drives
pub struct PipelineComponents {
    pub store: Arc<dyn PageStore>,
    pub sources: Arc<dyn SourcePageProvider>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub translator: Arc<dyn PageTranslator>,
    pub publisher: Arc<dyn ResultPublisher>,
}

/// Read-only view of a translation variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslationStatus {
    pub status: PageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

pub struct TranslationOrchestrator {
    store: Arc<dyn PageStore>,
    sources: Arc<dyn SourcePageProvider>,
    fetcher: Arc<dyn ImageFetcher>,
    translator: Arc<dyn PageTranslator>,
    publisher: Arc<dyn ResultPublisher>,
    profile: TranslationProfile,
    job_permits: Semaphore,
    job_timeout: Duration,
    claim_lease: Duration,
    metrics: Metrics,
}

impl TranslationOrchestrator {
    pub fn new(
        components: PipelineComponents,
        profile: TranslationProfile,
        jobs: &JobConfig,
        metrics: Metrics,
    ) -> Self {
        info!(
            "✓ Orchestrator ready (jobs: {}, timeout: {}s, lease: {}s)",
            jobs.max_concurrent_jobs,
            jobs.job_timeout.as_secs(),
            jobs.claim_lease.as_secs()
        );

        Self {
            store: components.store,
            sources: components.sources,
            fetcher: components.fetcher,
            translator: components.translator,
            publisher: components.publisher,
            profile,
            job_permits: Semaphore::new(jobs.max_concurrent_jobs),
            job_timeout: jobs.job_timeout,
            claim_lease: jobs.claim_lease,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Number of job slots currently free
    pub fn available_permits(&self) -> usize {
        self.job_permits.available_permits()
    }

    /// Stop starting new jobs. Running jobs finish; later requests that would
    /// start a job fail with `ShuttingDown`.
    pub fn shutdown(&self) {
        self.job_permits.close();
    }

    /// Ensure a translated rendition of a page exists.
    ///
    /// # Workflow:
    /// 1. Validate the language (no store access on failure)
    /// 2. Resolve the source page
    /// 3. Answer from the stored row when translated or in flight
    /// 4. Otherwise claim, run the job, and finalize or roll back
    #[instrument(skip(self))]
    pub async fn request_translation(
        &self,
        page_id: i64,
        target_language: &str,
    ) -> PipelineResult<TranslationOutcome> {
        self.metrics.record_request();

        let language = self.parse_language(target_language)?;
        let source = self.resolve_source(page_id).await?;
        let key = PageKey::for_source(&source, language);

        if let Some(outcome) = self.existing_outcome(&key).await? {
            return Ok(outcome);
        }

        if self.job_permits.is_closed() {
            return Err(PipelineError::ShuttingDown);
        }

        // Queueing for a slot counts against the job deadline. The deadline
        // starts before the lease does and the lease outlasts the timeout,
        // so a claim never expires while its job is alive.
        let deadline = Instant::now() + self.job_timeout;

        let Some(claim) = self.store.claim_processing(&key, self.claim_lease).await? else {
            // Lost the race; the winner may already be done
            debug!("Claim for {} lost to a concurrent job", key);
            return Ok(self
                .existing_outcome(&key)
                .await?
                .unwrap_or(TranslationOutcome::Accepted));
        };

        let guard = ClaimGuard::new(Arc::clone(&self.store), claim, self.metrics.clone());
        self.run_job(guard, &source, language, deadline).await
    }

    /// Current status of a translation variant without starting any work
    pub async fn translation_status(
        &self,
        page_id: i64,
        target_language: &str,
    ) -> PipelineResult<TranslationStatus> {
        let language = self.parse_language(target_language)?;
        let source = self.resolve_source(page_id).await?;
        let key = PageKey::for_source(&source, language);

        let status = match self.store.find_translation(&key).await? {
            Some(row) => TranslationStatus {
                status: row.status_at(Utc::now()),
                image_url: row.image_url().map(str::to_string),
            },
            None => TranslationStatus {
                status: PageStatus::NotTranslated,
                image_url: None,
            },
        };
        Ok(status)
    }

    fn parse_language(&self, target_language: &str) -> PipelineResult<TargetLanguage> {
        target_language.parse().map_err(|_| {
            self.metrics.record_rejected();
            PipelineError::InvalidArgument(target_language.to_string())
        })
    }

    async fn resolve_source(&self, page_id: i64) -> PipelineResult<SourcePage> {
        self.sources
            .get_source_page(page_id)
            .await?
            .ok_or(PipelineError::NotFound(page_id))
    }

    /// Outcome implied by the stored row, or `None` when a job must run
    async fn existing_outcome(&self, key: &PageKey) -> PipelineResult<Option<TranslationOutcome>> {
        let Some(row) = self.store.find_translation(key).await? else {
            return Ok(None);
        };

        let outcome = match row.status_at(Utc::now()) {
            PageStatus::Translated => row.image_url().map(|url| {
                self.metrics.record_cache_hit();
                TranslationOutcome::Completed {
                    image_url: url.to_string(),
                    cached: true,
                }
            }),
            PageStatus::Processing => {
                self.metrics.record_in_flight_hit();
                Some(TranslationOutcome::Accepted)
            }
            PageStatus::NotTranslated => None,
        };
        Ok(outcome)
    }

    async fn run_job(
        &self,
        guard: ClaimGuard,
        source: &SourcePage,
        language: TargetLanguage,
        deadline: Instant,
    ) -> PipelineResult<TranslationOutcome> {
        let permit = match timeout_at(deadline, self.job_permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                guard.rollback().await;
                return Err(PipelineError::ShuttingDown);
            }
            Err(_) => {
                warn!(
                    "No job slot for page {} ({}) within {}s",
                    source.page_id,
                    language,
                    self.job_timeout.as_secs_f64()
                );
                guard.rollback().await;
                return Err(PipelineError::TimedOut(self.job_timeout));
            }
        };

        self.metrics.record_job_started();
        let start = Instant::now();
        let target = PublishTarget {
            chapter_id: source.chapter_id,
            page_id: source.page_id,
            language,
        };

        let result = timeout_at(deadline, self.execute(source, language, &target))
            .await
            .unwrap_or(Err(PipelineError::TimedOut(self.job_timeout)));
        drop(permit);

        match result {
            Ok(image_url) => {
                guard.complete(image_url.clone()).await?;
                self.metrics.record_job_completed();
                info!(
                    "✓ Page {} ({}) translated in {:.1}s",
                    source.page_id,
                    language,
                    start.elapsed().as_secs_f64()
                );
                Ok(TranslationOutcome::Completed {
                    image_url,
                    cached: false,
                })
            }
            Err(e) => {
                self.metrics.record_job_failed();
                warn!("Job for page {} ({}) failed: {}", source.page_id, language, e);
                guard.rollback().await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        source: &SourcePage,
        language: TargetLanguage,
        target: &PublishTarget,
    ) -> PipelineResult<String> {
        let image = self.fetcher.fetch(&source.image_location).await?;
        let rendered = self
            .translator
            .translate(&image, &source.language, language, &self.profile)
            .await?;
        let image_url = self.publisher.publish(&rendered, target).await?;
        Ok(image_url)
    }
}

/// Exclusive claim on a key for the lifetime of one job.
///
/// Dropping an unfinished guard (caller cancelled, panic, early return)
/// spawns a rollback on the current runtime.
struct ClaimGuard {
    store: Arc<dyn PageStore>,
    claim: ClaimToken,
    metrics: Metrics,
    finished: bool,
}

impl ClaimGuard {
    fn new(store: Arc<dyn PageStore>, claim: ClaimToken, metrics: Metrics) -> Self {
        Self {
            store,
            claim,
            metrics,
            finished: false,
        }
    }

    /// Record the published URL. A lost claim is logged, not an error.
    async fn complete(mut self, image_url: String) -> StoreResult<bool> {
        let applied = self
            .store
            .finalize(&self.claim, Finalization::Translated { image_url })
            .await?;
        self.finished = true;

        if !applied {
            warn!(
                "Claim on {} expired before completion; stored row left to the newer job",
                self.claim.key
            );
        }
        Ok(applied)
    }

    async fn rollback(mut self) {
        let result = self.store.finalize(&self.claim, Finalization::Rollback).await;
        self.finished = true;
        log_rollback(&self.claim, &self.metrics, result);
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                "No runtime to roll back {}; the lease will release it",
                self.claim.key
            );
            return;
        };

        let store = Arc::clone(&self.store);
        let claim = self.claim.clone();
        let metrics = self.metrics.clone();
        handle.spawn(async move {
            let result = store.finalize(&claim, Finalization::Rollback).await;
            log_rollback(&claim, &metrics, result);
        });
    }
}

fn log_rollback(claim: &ClaimToken, metrics: &Metrics, result: StoreResult<bool>) {
    match result {
        Ok(true) => {
            metrics.record_rollback();
            debug!("Rolled back {}", claim.key);
        }
        Ok(false) => debug!("Rollback of {} skipped, claim already superseded", claim.key),
        Err(e) => error!(
            "Rollback of {} failed, the lease will release it: {}",
            claim.key, e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{
        ErrorKind, FetchResult, PublishResult, TranslationError, TranslationResult,
    };
    use crate::core::types::{TranslatedPage, TranslationState};
    use crate::store::MemoryPageStore;
    use crate::utils::image_ops::test_images;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use uuid::Uuid;

    struct FakeFetcher;

    #[async_trait]
    impl ImageFetcher for FakeFetcher {
        async fn fetch(&self, _location: &str) -> FetchResult<Vec<u8>> {
            Ok(test_images::png())
        }
    }

    #[derive(Default)]
    struct Gate {
        entered: Notify,
        release: Notify,
    }

    #[derive(Default)]
    struct FakeTranslator {
        calls: AtomicUsize,
        fail_next: AtomicBool,
        gate: Option<Gate>,
        delay: Option<Duration>,
    }

    impl FakeTranslator {
        fn gated() -> Self {
            Self {
                gate: Some(Gate::default()),
                ..Default::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn wait_entered(&self) {
            if let Some(gate) = &self.gate {
                gate.entered.notified().await;
            }
        }

        fn release(&self) {
            if let Some(gate) = &self.gate {
                gate.release.notify_one();
            }
        }
    }

    #[async_trait]
    impl PageTranslator for FakeTranslator {
        async fn translate(
            &self,
            image: &[u8],
            _source_language: &str,
            _target_language: TargetLanguage,
            _profile: &TranslationProfile,
        ) -> TranslationResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(TranslationError::Rejected {
                    status: 200,
                    message: "No text regions detected".into(),
                });
            }
            Ok(image.to_vec())
        }
    }

    struct FakePublisher;

    #[async_trait]
    impl ResultPublisher for FakePublisher {
        async fn publish(&self, _rendered: &[u8], target: &PublishTarget) -> PublishResult<String> {
            Ok(format!("https://cdn.test/{}", target.object_path("png")))
        }
    }

    struct Harness {
        store: Arc<MemoryPageStore>,
        translator: Arc<FakeTranslator>,
        orchestrator: Arc<TranslationOrchestrator>,
    }

    fn harness(translator: FakeTranslator, job_timeout: Duration) -> Harness {
        harness_with_jobs(
            translator,
            JobConfig {
                max_concurrent_jobs: 2,
                job_timeout,
                claim_lease: Duration::from_secs(600),
                reconcile_interval: Duration::from_secs(60),
            },
        )
    }

    /// Pages 42, 43 and 44 of chapter 7
    fn harness_with_jobs(translator: FakeTranslator, jobs: JobConfig) -> Harness {
        let store = Arc::new(MemoryPageStore::new());
        for (page_id, page_number) in [(42, 3), (43, 4), (44, 5)] {
            store.seed_source_page(SourcePage {
                page_id,
                chapter_id: 7,
                page_number,
                image_location: format!("https://images.test/raw/{}.png", page_id),
                language: "ja".into(),
            });
        }
        let translator = Arc::new(translator);

        let orchestrator = TranslationOrchestrator::new(
            PipelineComponents {
                store: store.clone(),
                sources: store.clone(),
                fetcher: Arc::new(FakeFetcher),
                translator: translator.clone(),
                publisher: Arc::new(FakePublisher),
            },
            TranslationProfile::default(),
            &jobs,
            Metrics::new(),
        );

        Harness {
            store,
            translator,
            orchestrator: Arc::new(orchestrator),
        }
    }

    fn key() -> PageKey {
        PageKey::new(7, 3, TargetLanguage::Vietnamese)
    }

    async fn wait_for_status(store: &MemoryPageStore, expected: PageStatus) {
        for _ in 0..200 {
            let status = store
                .find_translation(&key())
                .await
                .unwrap()
                .map(|row| row.status());
            if status == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("row never reached {:?}", expected);
    }

    #[tokio::test]
    async fn test_completes_then_serves_from_cache() {
        let h = harness(FakeTranslator::default(), Duration::from_secs(5));

        let first = h.orchestrator.request_translation(42, "vi").await.unwrap();
        assert_eq!(
            first,
            TranslationOutcome::Completed {
                image_url: "https://cdn.test/translations/7/42-vi.png".into(),
                cached: false,
            }
        );

        let second = h.orchestrator.request_translation(42, "vi").await.unwrap();
        assert_eq!(
            second,
            TranslationOutcome::Completed {
                image_url: "https://cdn.test/translations/7/42-vi.png".into(),
                cached: true,
            }
        );
        assert_eq!(h.translator.calls(), 1);

        let row = h.store.find_translation(&key()).await.unwrap().unwrap();
        assert_eq!(row.image_url(), Some("https://cdn.test/translations/7/42-vi.png"));

        let stats = h.orchestrator.metrics().snapshot();
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_job() {
        let h = harness(FakeTranslator::gated(), Duration::from_secs(5));

        let orchestrator = Arc::clone(&h.orchestrator);
        let first = tokio::spawn(async move { orchestrator.request_translation(42, "vi").await });
        h.translator.wait_entered().await;

        let second = h.orchestrator.request_translation(42, "vi").await.unwrap();
        assert_eq!(second, TranslationOutcome::Accepted);

        let status = h.orchestrator.translation_status(42, "vi").await.unwrap();
        assert_eq!(status.status, PageStatus::Processing);

        h.translator.release();
        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, TranslationOutcome::Completed { cached: false, .. }));
        assert_eq!(h.translator.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_rendered_image_rolls_back() {
        let h = harness(FakeTranslator::default(), Duration::from_secs(5));
        h.translator.fail_next.store(true, Ordering::SeqCst);

        let err = h.orchestrator.request_translation(42, "vi").await.unwrap_err();
        assert!(matches!(err, PipelineError::Upstream(TranslationError::Rejected { .. })));
        assert_eq!(err.kind(), ErrorKind::UpstreamFailure);

        let row = h.store.find_translation(&key()).await.unwrap().unwrap();
        assert_eq!(row.state, TranslationState::NotTranslated);

        // Next request retries the upstream call
        let outcome = h.orchestrator.request_translation(42, "vi").await.unwrap();
        assert!(matches!(outcome, TranslationOutcome::Completed { cached: false, .. }));
        assert_eq!(h.translator.calls(), 2);
        assert_eq!(h.orchestrator.metrics().snapshot().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_invalid_language_touches_nothing() {
        let h = harness(FakeTranslator::default(), Duration::from_secs(5));

        let err = h.orchestrator.request_translation(42, "fr").await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArgument(ref lang) if lang == "fr"));
        assert_eq!(h.store.translation_count(), 0);
        assert_eq!(h.translator.calls(), 0);
        assert_eq!(h.orchestrator.metrics().snapshot().rejected_requests, 1);
    }

    #[tokio::test]
    async fn test_unknown_page_is_not_found() {
        let h = harness(FakeTranslator::default(), Duration::from_secs(5));

        let err = h.orchestrator.request_translation(404, "en").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(404)));
        assert_eq!(h.store.translation_count(), 0);
    }

    #[tokio::test]
    async fn test_live_claim_is_respected_and_expired_claim_is_taken_over() {
        let h = harness(FakeTranslator::default(), Duration::from_secs(5));
        let processing = |lease_expires_at| TranslatedPage {
            key: key(),
            state: TranslationState::Processing {
                claim_id: Uuid::new_v4(),
                lease_expires_at,
            },
            updated_at: Utc::now(),
        };

        h.store
            .put_translation(processing(Utc::now() + chrono::Duration::minutes(5)));
        let outcome = h.orchestrator.request_translation(42, "vi").await.unwrap();
        assert_eq!(outcome, TranslationOutcome::Accepted);
        assert_eq!(h.translator.calls(), 0);

        h.store
            .put_translation(processing(Utc::now() - chrono::Duration::minutes(5)));
        let outcome = h.orchestrator.request_translation(42, "vi").await.unwrap();
        assert!(matches!(outcome, TranslationOutcome::Completed { cached: false, .. }));
        assert_eq!(h.translator.calls(), 1);
    }

    #[tokio::test]
    async fn test_superseded_claim_still_returns_url() {
        let h = harness(FakeTranslator::gated(), Duration::from_secs(5));

        let orchestrator = Arc::clone(&h.orchestrator);
        let job = tokio::spawn(async move { orchestrator.request_translation(42, "vi").await });
        h.translator.wait_entered().await;

        // Another worker took the key over while this job was running
        let newer = Uuid::new_v4();
        h.store.put_translation(TranslatedPage {
            key: key(),
            state: TranslationState::Processing {
                claim_id: newer,
                lease_expires_at: Utc::now() + chrono::Duration::minutes(5),
            },
            updated_at: Utc::now(),
        });

        h.translator.release();
        let outcome = job.await.unwrap().unwrap();
        assert_eq!(
            outcome.image_url(),
            Some("https://cdn.test/translations/7/42-vi.png")
        );

        let row = h.store.find_translation(&key()).await.unwrap().unwrap();
        assert!(matches!(
            row.state,
            TranslationState::Processing { claim_id, .. } if claim_id == newer
        ));
    }

    #[tokio::test]
    async fn test_cancelled_caller_rolls_back() {
        let h = harness(FakeTranslator::gated(), Duration::from_secs(5));

        let orchestrator = Arc::clone(&h.orchestrator);
        let job = tokio::spawn(async move { orchestrator.request_translation(42, "vi").await });
        h.translator.wait_entered().await;
        wait_for_status(&h.store, PageStatus::Processing).await;

        job.abort();
        assert!(job.await.unwrap_err().is_cancelled());

        wait_for_status(&h.store, PageStatus::NotTranslated).await;
        assert_eq!(h.orchestrator.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_job_timeout_rolls_back() {
        // Gate is never released
        let h = harness(FakeTranslator::gated(), Duration::from_millis(50));

        let err = h.orchestrator.request_translation(42, "vi").await.unwrap_err();
        assert!(matches!(err, PipelineError::TimedOut(_)));

        let row = h.store.find_translation(&key()).await.unwrap().unwrap();
        assert_eq!(row.state, TranslationState::NotTranslated);
        assert_eq!(h.orchestrator.metrics().snapshot().jobs_failed, 1);
    }

    #[tokio::test]
    async fn test_queued_request_gives_up_before_its_lease_lapses() {
        // One slot, 90ms per page: page 44 would wait ~180ms for its turn,
        // past both the 150ms deadline and the 200ms lease
        let h = harness_with_jobs(
            FakeTranslator::slow(Duration::from_millis(90)),
            JobConfig {
                max_concurrent_jobs: 1,
                job_timeout: Duration::from_millis(150),
                claim_lease: Duration::from_millis(200),
                reconcile_interval: Duration::from_secs(60),
            },
        );
        let spawn_request = |page_id: i64| {
            let orchestrator = Arc::clone(&h.orchestrator);
            tokio::spawn(async move { orchestrator.request_translation(page_id, "vi").await })
        };

        let first = spawn_request(42);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = spawn_request(43);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let queued = spawn_request(44);

        tokio::time::sleep(Duration::from_millis(230)).await;
        let retried = h.orchestrator.request_translation(44, "vi").await.unwrap();

        assert!(matches!(
            first.await.unwrap(),
            Ok(TranslationOutcome::Completed { cached: false, .. })
        ));
        assert!(matches!(second.await.unwrap(), Err(PipelineError::TimedOut(_))));
        assert!(matches!(queued.await.unwrap(), Err(PipelineError::TimedOut(_))));
        // Only the retry renders page 44
        assert_eq!(
            retried,
            TranslationOutcome::Completed {
                image_url: "https://cdn.test/translations/7/44-vi.png".into(),
                cached: false,
            }
        );
        assert_eq!(h.orchestrator.metrics().snapshot().jobs_completed, 2);
        assert_eq!(h.orchestrator.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_jobs() {
        let h = harness(FakeTranslator::default(), Duration::from_secs(5));
        h.orchestrator.shutdown();

        let err = h.orchestrator.request_translation(42, "vi").await.unwrap_err();
        assert!(matches!(err, PipelineError::ShuttingDown));
        assert_eq!(h.translator.calls(), 0);
    }

    #[tokio::test]
    async fn test_status_of_untouched_page() {
        let h = harness(FakeTranslator::default(), Duration::from_secs(5));

        let status = h.orchestrator.translation_status(42, "en").await.unwrap();
        assert_eq!(
            status,
            TranslationStatus {
                status: PageStatus::NotTranslated,
                image_url: None,
            }
        );
        assert!(matches!(
            h.orchestrator.translation_status(42, "xx").await,
            Err(PipelineError::InvalidArgument(_))
        ));
    }
}
