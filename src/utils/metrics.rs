use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pipeline metrics collector.
///
/// Tracks request outcomes, upstream and publish latency, and claim
/// housekeeping. Cheap to clone; all clones share the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Request outcomes
    requests_total: AtomicUsize,
    cache_hits: AtomicUsize,
    in_flight_hits: AtomicUsize,
    rejected_requests: AtomicUsize,

    // Job lifecycle
    jobs_started: AtomicUsize,
    jobs_completed: AtomicUsize,
    jobs_failed: AtomicUsize,
    rollbacks: AtomicUsize,
    stale_claims_released: AtomicUsize,

    // Translation service
    upstream_calls_total: AtomicUsize,
    upstream_calls_success: AtomicUsize,
    upstream_calls_failed: AtomicUsize,
    upstream_latency_ms: RwLock<Vec<u64>>,
    circuit_breaker_trips: AtomicUsize,

    // Object storage
    publish_latency_ms: RwLock<Vec<u64>>,

    // Per-endpoint request counters
    endpoint_counters: DashMap<String, AtomicUsize>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                requests_total: AtomicUsize::new(0),
                cache_hits: AtomicUsize::new(0),
                in_flight_hits: AtomicUsize::new(0),
                rejected_requests: AtomicUsize::new(0),
                jobs_started: AtomicUsize::new(0),
                jobs_completed: AtomicUsize::new(0),
                jobs_failed: AtomicUsize::new(0),
                rollbacks: AtomicUsize::new(0),
                stale_claims_released: AtomicUsize::new(0),
                upstream_calls_total: AtomicUsize::new(0),
                upstream_calls_success: AtomicUsize::new(0),
                upstream_calls_failed: AtomicUsize::new(0),
                upstream_latency_ms: RwLock::new(Vec::new()),
                circuit_breaker_trips: AtomicUsize::new(0),
                publish_latency_ms: RwLock::new(Vec::new()),
                endpoint_counters: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    // Request outcomes
    pub fn record_request(&self) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_in_flight_hit(&self) {
        self.inner.in_flight_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.inner.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    // Job lifecycle
    pub fn record_job_started(&self) {
        self.inner.jobs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_completed(&self) {
        self.inner.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_failed(&self) {
        self.inner.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.inner.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_claims_released(&self, count: usize) {
        self.inner
            .stale_claims_released
            .fetch_add(count, Ordering::Relaxed);
    }

    // Translation service
    pub fn record_upstream_call(&self, success: bool, duration: Duration) {
        self.inner.upstream_calls_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.inner.upstream_calls_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.upstream_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.inner
            .upstream_latency_ms
            .write()
            .push(duration.as_millis() as u64);
    }

    pub fn record_circuit_breaker_trip(&self) {
        self.inner.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    // Object storage
    pub fn record_publish(&self, duration: Duration) {
        self.inner
            .publish_latency_ms
            .write()
            .push(duration.as_millis() as u64);
    }

    // Endpoint Metrics
    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner
            .endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let upstream_latency = self.inner.upstream_latency_ms.read();
        let upstream_latency_avg_ms = avg(&upstream_latency);
        let upstream_latency_p50_ms = percentile(&upstream_latency, 0.5);
        let upstream_latency_p95_ms = percentile(&upstream_latency, 0.95);
        drop(upstream_latency);

        let publish_latency_avg_ms = avg(&self.inner.publish_latency_ms.read());

        let requests_total = self.inner.requests_total.load(Ordering::Relaxed);
        let cache_hits = self.inner.cache_hits.load(Ordering::Relaxed);
        let cache_hit_rate = if requests_total > 0 {
            cache_hits as f64 / requests_total as f64
        } else {
            0.0
        };

        let mut endpoint_requests: Vec<(String, usize)> = self
            .inner
            .endpoint_counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        endpoint_requests.sort();

        MetricsSnapshot {
            requests_total,
            cache_hits,
            cache_hit_rate,
            in_flight_hits: self.inner.in_flight_hits.load(Ordering::Relaxed),
            rejected_requests: self.inner.rejected_requests.load(Ordering::Relaxed),
            jobs_started: self.inner.jobs_started.load(Ordering::Relaxed),
            jobs_completed: self.inner.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.inner.jobs_failed.load(Ordering::Relaxed),
            rollbacks: self.inner.rollbacks.load(Ordering::Relaxed),
            stale_claims_released: self.inner.stale_claims_released.load(Ordering::Relaxed),
            upstream_calls_total: self.inner.upstream_calls_total.load(Ordering::Relaxed),
            upstream_calls_success: self.inner.upstream_calls_success.load(Ordering::Relaxed),
            upstream_calls_failed: self.inner.upstream_calls_failed.load(Ordering::Relaxed),
            upstream_latency_avg_ms,
            upstream_latency_p50_ms,
            upstream_latency_p95_ms,
            publish_latency_avg_ms,
            circuit_breaker_trips: self.inner.circuit_breaker_trips.load(Ordering::Relaxed),
            endpoint_requests,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        let counters: [(&str, &str, usize); 13] = [
            ("translation_requests_total", "Translation requests received", s.requests_total),
            ("translation_cache_hits_total", "Requests answered from an existing translation", s.cache_hits),
            ("translation_in_flight_hits_total", "Requests that found a job already running", s.in_flight_hits),
            ("translation_rejected_total", "Requests rejected before any work", s.rejected_requests),
            ("translation_jobs_started_total", "Jobs that won the processing claim", s.jobs_started),
            ("translation_jobs_completed_total", "Jobs that published a rendered page", s.jobs_completed),
            ("translation_jobs_failed_total", "Jobs that ended in failure", s.jobs_failed),
            ("translation_rollbacks_total", "Claims rolled back to not translated", s.rollbacks),
            ("translation_stale_claims_released_total", "Expired claims released by the reconciler", s.stale_claims_released),
            ("upstream_calls_total", "Calls made to the translation service", s.upstream_calls_total),
            ("upstream_calls_success_total", "Successful translation service calls", s.upstream_calls_success),
            ("upstream_calls_failed_total", "Failed translation service calls", s.upstream_calls_failed),
            ("circuit_breaker_trips_total", "Times the translation circuit opened", s.circuit_breaker_trips),
        ];
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n\n"
            ));
        }

        out.push_str(&format!(
            "# HELP upstream_latency_avg_ms Average translation service latency in milliseconds\n\
             # TYPE upstream_latency_avg_ms gauge\n\
             upstream_latency_avg_ms {}\n\n",
            s.upstream_latency_avg_ms
        ));
        out.push_str(&format!(
            "# HELP publish_latency_avg_ms Average object storage upload latency in milliseconds\n\
             # TYPE publish_latency_avg_ms gauge\n\
             publish_latency_avg_ms {}\n\n",
            s.publish_latency_avg_ms
        ));

        out.push_str("# HELP http_requests_total Requests per endpoint\n# TYPE http_requests_total counter\n");
        for (endpoint, count) in &s.endpoint_requests {
            out.push_str(&format!(
                "http_requests_total{{endpoint=\"{}\"}} {}\n",
                endpoint, count
            ));
        }
        out.push('\n');

        out.push_str(&format!(
            "# HELP uptime_seconds Application uptime in seconds\n\
             # TYPE uptime_seconds counter\n\
             uptime_seconds {}\n",
            s.uptime_seconds
        ));
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_total: usize,
    pub cache_hits: usize,
    pub cache_hit_rate: f64,
    pub in_flight_hits: usize,
    pub rejected_requests: usize,
    pub jobs_started: usize,
    pub jobs_completed: usize,
    pub jobs_failed: usize,
    pub rollbacks: usize,
    pub stale_claims_released: usize,
    pub upstream_calls_total: usize,
    pub upstream_calls_success: usize,
    pub upstream_calls_failed: usize,
    pub upstream_latency_avg_ms: u64,
    pub upstream_latency_p50_ms: u64,
    pub upstream_latency_p95_ms: u64,
    pub publish_latency_avg_ms: u64,
    pub circuit_breaker_trips: usize,
    pub endpoint_requests: Vec<(String, usize)>,
    pub uptime_seconds: u64,
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_request();
        metrics.record_request();
        metrics.record_cache_hit();
        metrics.record_job_started();
        metrics.record_upstream_call(true, Duration::from_millis(100));
        metrics.record_upstream_call(false, Duration::from_millis(300));
        metrics.record_job_failed();
        metrics.record_rollback();
        metrics.record_stale_claims_released(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_hit_rate, 0.5);
        assert_eq!(snapshot.jobs_started, 1);
        assert_eq!(snapshot.upstream_calls_total, 2);
        assert_eq!(snapshot.upstream_calls_success, 1);
        assert_eq!(snapshot.upstream_calls_failed, 1);
        assert_eq!(snapshot.upstream_latency_avg_ms, 200);
        assert_eq!(snapshot.rollbacks, 1);
        assert_eq!(snapshot.stale_claims_released, 3);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_request();
        metrics.record_endpoint_request("POST /pages/:page_id/translations/:language");

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("translation_requests_total 1"));
        assert!(prometheus.contains("# TYPE upstream_calls_total counter"));
        assert!(prometheus
            .contains("http_requests_total{endpoint=\"POST /pages/:page_id/translations/:language\"} 1"));
    }
}
