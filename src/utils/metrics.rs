use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::errors::{ErrorKind, StageName};

/// Latency samples kept per series
const MAX_SAMPLES: usize = 10_000;

/// Process-wide metrics collector. Cheap to clone, shared across batches.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Inference
    inference_calls_total: AtomicUsize,
    inference_calls_failed: AtomicUsize,
    inference_latency_ms: RwLock<Vec<u64>>,

    // Stages
    stage_duration_ms: DashMap<StageName, RwLock<Vec<u64>>>,
    stage_retries: AtomicUsize,

    // Documents and batches
    batches_submitted: AtomicUsize,
    batches_completed: AtomicUsize,
    documents_succeeded: AtomicUsize,
    documents_failed: AtomicUsize,
    document_timeouts: AtomicUsize,
    failures_by_kind: DashMap<ErrorKind, AtomicUsize>,
    detections_total: AtomicU64,

    endpoint_counters: DashMap<String, AtomicUsize>,
    circuit_breaker_trips: AtomicUsize,

    start_time: Instant,
}

fn push_sample(series: &RwLock<Vec<u64>>, duration: Duration) {
    let mut samples = series.write();
    if samples.len() >= MAX_SAMPLES {
        samples.remove(0);
    }
    samples.push(duration.as_millis() as u64);
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                inference_calls_total: AtomicUsize::new(0),
                inference_calls_failed: AtomicUsize::new(0),
                inference_latency_ms: RwLock::new(Vec::new()),
                stage_duration_ms: DashMap::new(),
                stage_retries: AtomicUsize::new(0),
                batches_submitted: AtomicUsize::new(0),
                batches_completed: AtomicUsize::new(0),
                documents_succeeded: AtomicUsize::new(0),
                documents_failed: AtomicUsize::new(0),
                document_timeouts: AtomicUsize::new(0),
                failures_by_kind: DashMap::new(),
                detections_total: AtomicU64::new(0),
                endpoint_counters: DashMap::new(),
                circuit_breaker_trips: AtomicUsize::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_inference(&self, success: bool, duration: Duration) {
        self.inner.inference_calls_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.inner.inference_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        push_sample(&self.inner.inference_latency_ms, duration);
    }

    pub fn record_stage_duration(&self, stage: StageName, duration: Duration) {
        let series = self
            .inner
            .stage_duration_ms
            .entry(stage)
            .or_insert_with(|| RwLock::new(Vec::new()));
        push_sample(&series, duration);
    }

    pub fn record_stage_retry(&self) {
        self.inner.stage_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_submitted(&self) {
        self.inner.batches_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_completed(&self) {
        self.inner.batches_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_document_succeeded(&self, detections: usize) {
        self.inner.documents_succeeded.fetch_add(1, Ordering::Relaxed);
        self.inner
            .detections_total
            .fetch_add(detections as u64, Ordering::Relaxed);
    }

    pub fn record_document_failed(&self, kind: ErrorKind) {
        self.inner.documents_failed.fetch_add(1, Ordering::Relaxed);
        if kind == ErrorKind::Timeout {
            self.inner.document_timeouts.fetch_add(1, Ordering::Relaxed);
        }
        self.inner
            .failures_by_kind
            .entry(kind)
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner
            .endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_breaker_trip(&self) {
        self.inner.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.inner.inference_latency_ms.read();
        let inference_latency_avg_ms = avg(&latency);
        let inference_latency_p50_ms = percentile(&latency, 0.5);
        let inference_latency_p95_ms = percentile(&latency, 0.95);
        let inference_latency_p99_ms = percentile(&latency, 0.99);
        drop(latency);

        let stage_avg_ms: BTreeMap<String, u64> = self
            .inner
            .stage_duration_ms
            .iter()
            .map(|entry| (entry.key().as_str().to_string(), avg(&entry.value().read())))
            .collect();

        let failures_by_kind: BTreeMap<String, usize> = self
            .inner
            .failures_by_kind
            .iter()
            .map(|entry| {
                (
                    entry.key().as_str().to_string(),
                    entry.value().load(Ordering::Relaxed),
                )
            })
            .collect();

        let endpoint_requests: BTreeMap<String, usize> = self
            .inner
            .endpoint_counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            inference_calls_total: self.inner.inference_calls_total.load(Ordering::Relaxed),
            inference_calls_failed: self.inner.inference_calls_failed.load(Ordering::Relaxed),
            inference_latency_avg_ms,
            inference_latency_p50_ms,
            inference_latency_p95_ms,
            inference_latency_p99_ms,
            stage_avg_ms,
            stage_retries: self.inner.stage_retries.load(Ordering::Relaxed),
            batches_submitted: self.inner.batches_submitted.load(Ordering::Relaxed),
            batches_completed: self.inner.batches_completed.load(Ordering::Relaxed),
            documents_succeeded: self.inner.documents_succeeded.load(Ordering::Relaxed),
            documents_failed: self.inner.documents_failed.load(Ordering::Relaxed),
            document_timeouts: self.inner.document_timeouts.load(Ordering::Relaxed),
            failures_by_kind,
            detections_total: self.inner.detections_total.load(Ordering::Relaxed),
            endpoint_requests,
            circuit_breaker_trips: self.inner.circuit_breaker_trips.load(Ordering::Relaxed),
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = format!(
            r#"# HELP inference_calls_total Total model inference calls
# TYPE inference_calls_total counter
inference_calls_total {}

# HELP inference_calls_failed_total Failed model inference calls
# TYPE inference_calls_failed_total counter
inference_calls_failed_total {}

# HELP inference_latency_ms Inference latency in milliseconds
# TYPE inference_latency_ms gauge
inference_latency_ms{{quantile="avg"}} {}
inference_latency_ms{{quantile="0.5"}} {}
inference_latency_ms{{quantile="0.95"}} {}
inference_latency_ms{{quantile="0.99"}} {}

# HELP stage_retries_total Transient stage failures that were retried
# TYPE stage_retries_total counter
stage_retries_total {}

# HELP batches_submitted_total Batches accepted
# TYPE batches_submitted_total counter
batches_submitted_total {}

# HELP batches_completed_total Batches with every document terminal
# TYPE batches_completed_total counter
batches_completed_total {}

# HELP documents_succeeded_total Documents that produced a result
# TYPE documents_succeeded_total counter
documents_succeeded_total {}

# HELP documents_failed_total Documents that produced a failure record
# TYPE documents_failed_total counter
documents_failed_total {}

# HELP document_timeouts_total Documents that exceeded their deadline
# TYPE document_timeouts_total counter
document_timeouts_total {}

# HELP detections_total Detections retained after consolidation
# TYPE detections_total counter
detections_total {}

# HELP circuit_breaker_trips_total Model circuit breaker trips
# TYPE circuit_breaker_trips_total counter
circuit_breaker_trips_total {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {}
"#,
            snapshot.inference_calls_total,
            snapshot.inference_calls_failed,
            snapshot.inference_latency_avg_ms,
            snapshot.inference_latency_p50_ms,
            snapshot.inference_latency_p95_ms,
            snapshot.inference_latency_p99_ms,
            snapshot.stage_retries,
            snapshot.batches_submitted,
            snapshot.batches_completed,
            snapshot.documents_succeeded,
            snapshot.documents_failed,
            snapshot.document_timeouts,
            snapshot.detections_total,
            snapshot.circuit_breaker_trips,
            snapshot.uptime_seconds,
        );

        out.push_str("\n# HELP stage_avg_duration_ms Average stage duration in milliseconds\n");
        out.push_str("# TYPE stage_avg_duration_ms gauge\n");
        for (stage, ms) in &snapshot.stage_avg_ms {
            let _ = writeln!(out, "stage_avg_duration_ms{{stage=\"{}\"}} {}", stage, ms);
        }

        out.push_str("\n# HELP document_failures_total Document failures by kind\n");
        out.push_str("# TYPE document_failures_total counter\n");
        for (kind, count) in &snapshot.failures_by_kind {
            let _ = writeln!(out, "document_failures_total{{kind=\"{}\"}} {}", kind, count);
        }

        out.push_str("\n# HELP http_requests_total Requests per endpoint\n");
        out.push_str("# TYPE http_requests_total counter\n");
        for (endpoint, count) in &snapshot.endpoint_requests {
            let _ = writeln!(out, "http_requests_total{{endpoint=\"{}\"}} {}", endpoint, count);
        }

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
    pub inference_calls_total: usize,
    pub inference_calls_failed: usize,
    pub inference_latency_avg_ms: u64,
    pub inference_latency_p50_ms: u64,
    pub inference_latency_p95_ms: u64,
    pub inference_latency_p99_ms: u64,
    pub stage_avg_ms: BTreeMap<String, u64>,
    pub stage_retries: usize,
    pub batches_submitted: usize,
    pub batches_completed: usize,
    pub documents_succeeded: usize,
    pub documents_failed: usize,
    pub document_timeouts: usize,
    pub failures_by_kind: BTreeMap<String, usize>,
    pub detections_total: u64,
    pub endpoint_requests: BTreeMap<String, usize>,
    pub circuit_breaker_trips: usize,
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

        metrics.record_inference(true, Duration::from_millis(100));
        metrics.record_inference(false, Duration::from_millis(50));
        metrics.record_document_succeeded(3);
        metrics.record_document_failed(ErrorKind::Decode);
        metrics.record_document_failed(ErrorKind::Timeout);
        metrics.record_stage_duration(StageName::Seal, Duration::from_millis(40));
        metrics.record_stage_duration(StageName::Seal, Duration::from_millis(20));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.inference_calls_total, 2);
        assert_eq!(snapshot.inference_calls_failed, 1);
        assert_eq!(snapshot.documents_succeeded, 1);
        assert_eq!(snapshot.documents_failed, 2);
        assert_eq!(snapshot.document_timeouts, 1);
        assert_eq!(snapshot.detections_total, 3);
        assert_eq!(snapshot.failures_by_kind.get("DecodeError"), Some(&1));
        assert_eq!(snapshot.stage_avg_ms.get("seal"), Some(&30));
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_document_failed(ErrorKind::Storage);
        metrics.record_stage_duration(StageName::Normalization, Duration::from_millis(12));

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("documents_failed_total 1"));
        assert!(prometheus.contains("document_failures_total{kind=\"StorageError\"} 1"));
        assert!(prometheus.contains("stage_avg_duration_ms{stage=\"normalization\"} 12"));
    }
}
