use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::types::PipelineState;

/// Duration samples kept per series; older samples are evicted first
pub const MAX_DURATION_SAMPLES: usize = 1000;

/// Bounded ring of the most recent duration samples (milliseconds)
struct DurationWindow {
    samples: RwLock<VecDeque<u64>>,
    capacity: usize,
}

impl DurationWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, duration: Duration) {
        let mut samples = self.samples.write();
        if samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(duration.as_millis() as u64);
    }

    fn len(&self) -> usize {
        self.samples.read().len()
    }

    fn avg(&self) -> u64 {
        let samples = self.samples.read();
        if samples.is_empty() {
            return 0;
        }
        samples.iter().sum::<u64>() / samples.len() as u64
    }

    fn percentile(&self, p: f64) -> u64 {
        let mut sorted: Vec<u64> = self.samples.read().iter().copied().collect();
        if sorted.is_empty() {
            return 0;
        }
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 - 1.0) * p) as usize;
        sorted[idx]
    }
}

/// Global metrics collector for the application.
///
/// Tracks pipeline runs, outcomes, and per-stage durations.
/// Thread-safe and can be shared across the application.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Run Metrics
    runs_started: AtomicUsize,
    runs_succeeded: AtomicUsize,
    runs_failed: AtomicUsize,
    no_tumor_outcomes: AtomicUsize,
    fallback_runs: AtomicUsize,

    // Stage Metrics
    preprocess_duration_ms: DurationWindow,
    inference_duration_ms: DurationWindow,
    postprocess_duration_ms: DurationWindow,
    features_duration_ms: DurationWindow,
    run_duration_ms: DurationWindow,

    // Failures keyed by error class
    failure_counters: DashMap<String, AtomicUsize>,

    // Per-endpoint request counters
    endpoint_counters: DashMap<String, AtomicUsize>,

    // Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self::with_sample_capacity(MAX_DURATION_SAMPLES)
    }

    /// Metrics keeping at most `capacity` duration samples per series
    pub fn with_sample_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                runs_started: AtomicUsize::new(0),
                runs_succeeded: AtomicUsize::new(0),
                runs_failed: AtomicUsize::new(0),
                no_tumor_outcomes: AtomicUsize::new(0),
                fallback_runs: AtomicUsize::new(0),
                preprocess_duration_ms: DurationWindow::new(capacity),
                inference_duration_ms: DurationWindow::new(capacity),
                postprocess_duration_ms: DurationWindow::new(capacity),
                features_duration_ms: DurationWindow::new(capacity),
                run_duration_ms: DurationWindow::new(capacity),
                failure_counters: DashMap::new(),
                endpoint_counters: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    // Run Metrics
    pub fn record_run_started(&self) {
        self.inner.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_succeeded(&self, duration: Duration, no_tumor: bool) {
        self.inner.runs_succeeded.fetch_add(1, Ordering::Relaxed);
        if no_tumor {
            self.inner.no_tumor_outcomes.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.run_duration_ms.push(duration);
    }

    pub fn record_run_failed(&self, error_kind: &str) {
        self.inner.runs_failed.fetch_add(1, Ordering::Relaxed);
        self.inner
            .failure_counters
            .entry(error_kind.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_run(&self) {
        self.inner.fallback_runs.fetch_add(1, Ordering::Relaxed);
    }

    // Stage Metrics
    pub fn record_stage_duration(&self, state: PipelineState, duration: Duration) {
        let bucket = match state {
            PipelineState::Preprocessing => &self.inner.preprocess_duration_ms,
            PipelineState::Inferring => &self.inner.inference_duration_ms,
            PipelineState::Postprocessing => &self.inner.postprocess_duration_ms,
            PipelineState::ExtractingFeatures => &self.inner.features_duration_ms,
            _ => return,
        };
        bucket.push(duration);
    }

    // Endpoint Metrics
    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner
            .endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    // Get snapshot for reporting
    pub fn snapshot(&self) -> MetricsSnapshot {
        let failures_by_kind = self
            .inner
            .failure_counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();

        let requests_by_endpoint = self
            .inner
            .endpoint_counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            runs_started: self.inner.runs_started.load(Ordering::Relaxed),
            runs_succeeded: self.inner.runs_succeeded.load(Ordering::Relaxed),
            runs_failed: self.inner.runs_failed.load(Ordering::Relaxed),
            no_tumor_outcomes: self.inner.no_tumor_outcomes.load(Ordering::Relaxed),
            fallback_runs: self.inner.fallback_runs.load(Ordering::Relaxed),
            preprocess_avg_ms: self.inner.preprocess_duration_ms.avg(),
            inference_avg_ms: self.inner.inference_duration_ms.avg(),
            postprocess_avg_ms: self.inner.postprocess_duration_ms.avg(),
            features_avg_ms: self.inner.features_duration_ms.avg(),
            run_avg_ms: self.inner.run_duration_ms.avg(),
            run_p50_ms: self.inner.run_duration_ms.percentile(0.5),
            run_p95_ms: self.inner.run_duration_ms.percentile(0.95),
            run_samples: self.inner.run_duration_ms.len(),
            failures_by_kind,
            requests_by_endpoint,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = format!(
            r#"# HELP diagnosis_runs_started_total Pipeline runs started
# TYPE diagnosis_runs_started_total counter
diagnosis_runs_started_total {}

# HELP diagnosis_runs_succeeded_total Pipeline runs completed
# TYPE diagnosis_runs_succeeded_total counter
diagnosis_runs_succeeded_total {}

# HELP diagnosis_runs_failed_total Pipeline runs failed
# TYPE diagnosis_runs_failed_total counter
diagnosis_runs_failed_total {}

# HELP diagnosis_no_tumor_total Completed runs with an empty mask
# TYPE diagnosis_no_tumor_total counter
diagnosis_no_tumor_total {}

# HELP diagnosis_fallback_runs_total Runs served by the synthetic fallback policy
# TYPE diagnosis_fallback_runs_total counter
diagnosis_fallback_runs_total {}

# HELP stage_avg_duration_ms Average stage duration in milliseconds
# TYPE stage_avg_duration_ms gauge
stage_avg_duration_ms{{stage="preprocessing"}} {}
stage_avg_duration_ms{{stage="inferring"}} {}
stage_avg_duration_ms{{stage="postprocessing"}} {}
stage_avg_duration_ms{{stage="extracting_features"}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {}
"#,
            snapshot.runs_started,
            snapshot.runs_succeeded,
            snapshot.runs_failed,
            snapshot.no_tumor_outcomes,
            snapshot.fallback_runs,
            snapshot.preprocess_avg_ms,
            snapshot.inference_avg_ms,
            snapshot.postprocess_avg_ms,
            snapshot.features_avg_ms,
            snapshot.uptime_seconds,
        );

        if !snapshot.failures_by_kind.is_empty() {
            out.push_str("\n# HELP diagnosis_failures_total Failed runs by error class\n");
            out.push_str("# TYPE diagnosis_failures_total counter\n");
            let mut kinds: Vec<_> = snapshot.failures_by_kind.iter().collect();
            kinds.sort();
            for (kind, count) in kinds {
                out.push_str(&format!("diagnosis_failures_total{{kind=\"{}\"}} {}\n", kind, count));
            }
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
    pub runs_started: usize,
    pub runs_succeeded: usize,
    pub runs_failed: usize,
    pub no_tumor_outcomes: usize,
    pub fallback_runs: usize,
    pub preprocess_avg_ms: u64,
    pub inference_avg_ms: u64,
    pub postprocess_avg_ms: u64,
    pub features_avg_ms: u64,
    pub run_avg_ms: u64,
    pub run_p50_ms: u64,
    pub run_p95_ms: u64,
    /// Samples behind the run averages (bounded by the window capacity)
    pub run_samples: usize,
    pub failures_by_kind: std::collections::BTreeMap<String, usize>,
    pub requests_by_endpoint: std::collections::BTreeMap<String, usize>,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_run_started();
        metrics.record_run_started();
        metrics.record_run_succeeded(Duration::from_millis(120), true);
        metrics.record_run_failed("DecodeError");
        metrics.record_stage_duration(PipelineState::Inferring, Duration::from_millis(80));
        metrics.record_stage_duration(PipelineState::Complete, Duration::from_millis(999));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.runs_started, 2);
        assert_eq!(snapshot.runs_succeeded, 1);
        assert_eq!(snapshot.runs_failed, 1);
        assert_eq!(snapshot.no_tumor_outcomes, 1);
        assert_eq!(snapshot.inference_avg_ms, 80);
        assert_eq!(snapshot.run_avg_ms, 120);
        assert_eq!(snapshot.failures_by_kind.get("DecodeError"), Some(&1));
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_run_started();
        metrics.record_run_failed("InferenceError");

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("diagnosis_runs_started_total 1"));
        assert!(prometheus.contains("diagnosis_failures_total{kind=\"InferenceError\"} 1"));
    }

    #[test]
    fn test_duration_samples_are_bounded() {
        let metrics = Metrics::with_sample_capacity(4);
        for ms in [1000, 1000, 1, 2, 3, 4] {
            metrics.record_run_succeeded(Duration::from_millis(ms), false);
            metrics.record_stage_duration(PipelineState::Preprocessing, Duration::from_millis(ms));
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.runs_succeeded, 6);
        assert_eq!(snapshot.run_samples, 4);
        // Only the last four samples remain: 1, 2, 3, 4
        assert_eq!(snapshot.run_avg_ms, 2);
        assert_eq!(snapshot.run_p95_ms, 3);
        assert_eq!(snapshot.preprocess_avg_ms, 2);
    }

    #[test]
    fn test_default_capacity() {
        let metrics = Metrics::new();
        for _ in 0..MAX_DURATION_SAMPLES + 25 {
            metrics.record_run_succeeded(Duration::from_millis(5), false);
        }
        assert_eq!(metrics.snapshot().run_samples, MAX_DURATION_SAMPLES);
    }
}
