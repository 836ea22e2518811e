use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Observations kept per histogram for percentile computation.
const HISTOGRAM_WINDOW: usize = 1024;

/// Type of metric.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// Point-in-time value of one metric series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub metric_type: MetricType,
    pub value: f64,
}

/// In-memory counter. Monotonically increasing.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// In-memory gauge. Can go up or down.
struct Gauge {
    // f64 bits, so the value can be swapped atomically
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }
    fn set(&self, v: f64) {
        self.value.store(v.to_bits() as i64, Ordering::Relaxed);
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed) as u64)
    }
}

/// Histogram over a sliding window of recent observations. Count and sum
/// cover every observation ever made.
struct Histogram {
    inner: Mutex<HistogramInner>,
}

struct HistogramInner {
    window: VecDeque<f64>,
    count: u64,
    sum: f64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HistogramInner {
                window: VecDeque::with_capacity(HISTOGRAM_WINDOW),
                count: 0,
                sum: 0.0,
            }),
        }
    }

    fn observe(&self, value: f64) {
        let mut inner = self.inner.lock();
        if inner.window.len() == HISTOGRAM_WINDOW {
            inner.window.pop_front();
        }
        inner.window.push_back(value);
        inner.count += 1;
        inner.sum += value;
    }

    fn summary(&self) -> HistogramSummary {
        let inner = self.inner.lock();
        if inner.window.is_empty() {
            return HistogramSummary::default();
        }
        let mut obs: Vec<f64> = inner.window.iter().copied().collect();
        obs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = obs.len();
        let at = |q: f64| obs[((n as f64 * q) as usize).min(n - 1)];
        HistogramSummary {
            count: inner.count,
            sum: inner.sum,
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Metric key: name + labels sorted by label name.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: impl Into<String>, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.into(),
            labels: sorted,
        }
    }

    fn label_map(&self) -> BTreeMap<String, String> {
        self.labels.iter().cloned().collect()
    }
}

/// Thread-safe in-process metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by n.
    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        let counters = self.counters.read();
        if let Some(c) = counters.get(&key) {
            c.increment(n);
            return;
        }
        drop(counters);
        let mut counters = self.counters.write();
        counters.entry(key).or_insert_with(Counter::new).increment(n);
    }

    /// Set a gauge to a specific value.
    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        let gauges = self.gauges.read();
        if let Some(g) = gauges.get(&key) {
            g.set(value);
            return;
        }
        drop(gauges);
        let mut gauges = self.gauges.write();
        gauges.entry(key).or_insert_with(Gauge::new).set(value);
    }

    /// Record a histogram observation.
    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        let histograms = self.histograms.read();
        if let Some(h) = histograms.get(&key) {
            h.observe(value);
            return;
        }
        drop(histograms);
        let mut histograms = self.histograms.write();
        histograms.entry(key).or_insert_with(Histogram::new).observe(value);
    }

    /// Get current value of a counter.
    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, Counter::get)
    }

    /// Get current value of a gauge.
    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0.0, Gauge::get)
    }

    /// Get a histogram summary.
    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    /// Current value of every series. Histograms report their p50.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let now = Utc::now().to_rfc3339();
        let mut samples = Vec::new();

        for (key, counter) in self.counters.read().iter() {
            samples.push(MetricSample {
                timestamp: now.clone(),
                name: key.name.clone(),
                labels: key.label_map(),
                metric_type: MetricType::Counter,
                value: counter.get() as f64,
            });
        }
        for (key, gauge) in self.gauges.read().iter() {
            samples.push(MetricSample {
                timestamp: now.clone(),
                name: key.name.clone(),
                labels: key.label_map(),
                metric_type: MetricType::Gauge,
                value: gauge.get(),
            });
        }
        for (key, histogram) in self.histograms.read().iter() {
            samples.push(MetricSample {
                timestamp: now.clone(),
                name: key.name.clone(),
                labels: key.label_map(),
                metric_type: MetricType::Histogram,
                value: histogram.summary().p50,
            });
        }

        samples.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        samples
    }
}

/// Log a metrics snapshot at `interval` until `cancel` fires.
pub fn spawn_reporter(
    recorder: std::sync::Arc<MetricsRecorder>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let samples = recorder.snapshot();
                    match serde_json::to_string(&samples) {
                        Ok(json) => tracing::info!(series = samples.len(), metrics = %json, "metrics snapshot"),
                        Err(e) => tracing::warn!(error = %e, "failed to encode metrics snapshot"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counter_basic() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("messages.skipped", &[("reason", "self")], 1);
        recorder.counter_inc("messages.skipped", &[("reason", "self")], 1);
        recorder.counter_inc("messages.skipped", &[("reason", "non_text")], 1);

        assert_eq!(recorder.counter_get("messages.skipped", &[("reason", "self")]), 2);
        assert_eq!(recorder.counter_get("messages.skipped", &[("reason", "non_text")]), 1);
        assert_eq!(recorder.counter_get("messages.skipped", &[("reason", "empty")]), 0);
    }

    #[test]
    fn gauge_overwrites() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_set("restart_count", &[], 3.0);
        recorder.gauge_set("restart_count", &[], 1.0);
        assert_eq!(recorder.gauge_get("restart_count", &[]), 1.0);
        assert_eq!(recorder.gauge_get("missing", &[]), 0.0);
    }

    #[test]
    fn histogram_observations() {
        let recorder = MetricsRecorder::new();
        for v in [10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0] {
            recorder.histogram_observe("handler.duration_ms", &[], v);
        }

        let summary = recorder.histogram_summary("handler.duration_ms", &[]);
        assert_eq!(summary.count, 10);
        assert_eq!(summary.sum, 550.0);
        assert!(summary.p50 >= 50.0 && summary.p50 <= 60.0);
        assert!(summary.p95 >= 90.0);
    }

    #[test]
    fn histogram_window_is_bounded() {
        let recorder = MetricsRecorder::new();
        for i in 0..(HISTOGRAM_WINDOW * 2) {
            recorder.histogram_observe("h", &[], i as f64);
        }
        let summary = recorder.histogram_summary("h", &[]);
        assert_eq!(summary.count, (HISTOGRAM_WINDOW * 2) as u64);
        // percentiles only see the most recent window
        assert!(summary.p50 >= HISTOGRAM_WINDOW as f64);
    }

    #[test]
    fn histogram_empty() {
        let recorder = MetricsRecorder::new();
        let summary = recorder.histogram_summary("nonexistent", &[]);
        assert_eq!(summary.count, 0);
        assert_eq!(summary.sum, 0.0);
    }

    #[test]
    fn label_ordering_independent() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("test", &[("a", "1"), ("b", "2")], 1);
        recorder.counter_inc("test", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(recorder.counter_get("test", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn snapshot_covers_all_series() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("b.counter", &[("k", "v")], 4);
        recorder.gauge_set("a.gauge", &[], 2.5);
        recorder.histogram_observe("c.histogram", &[], 7.0);

        let samples = recorder.snapshot();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].name, "a.gauge");
        assert_eq!(samples[0].metric_type, MetricType::Gauge);
        assert_eq!(samples[1].value, 4.0);
        assert_eq!(samples[1].labels.get("k").map(String::as_str), Some("v"));
        assert_eq!(samples[2].metric_type, MetricType::Histogram);
    }

    #[test]
    fn concurrent_counter_increments() {
        use std::thread;

        let recorder = Arc::new(MetricsRecorder::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let r = recorder.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        r.counter_inc("concurrent.test", &[], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(recorder.counter_get("concurrent.test", &[]), 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_stops_on_cancel() {
        let recorder = Arc::new(MetricsRecorder::new());
        let cancel = CancellationToken::new();
        let handle = spawn_reporter(recorder, Duration::from_secs(60), cancel.clone());

        tokio::time::sleep(Duration::from_secs(130)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
