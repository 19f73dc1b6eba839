//! Dispatch timing histograms: queue wait, backend latency and run duration.
//! Each metric keeps a bounded window of recent samples for percentiles plus
//! lifetime totals.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Samples kept per metric for percentile estimates.
const WINDOW: usize = 1024;

/// Measures from creation until `finish`.
pub struct TimingSpan {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    /// Record the elapsed time; returns it in microseconds.
    pub fn finish(self) -> f64 {
        let elapsed = self.start.elapsed();
        self.registry.record_duration(self.name, elapsed);
        elapsed.as_micros() as f64
    }
}

struct Histogram {
    window: VecDeque<f64>,
    capacity: usize,
    total: u64,
    sum_us: f64,
    max_us: f64,
}

impl Histogram {
    fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
            sum_us: 0.0,
            max_us: 0.0,
        }
    }

    fn push(&mut self, value_us: f64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(value_us);
        self.total += 1;
        self.sum_us += value_us;
        self.max_us = self.max_us.max(value_us);
    }

    /// Nearest-rank percentile over the window; 0 when empty.
    fn percentile(&self, p: f64) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let last = sorted.len() - 1;
        let idx = ((p / 100.0) * last as f64).round() as usize;
        sorted[idx.min(last)]
    }

    fn summary(&self) -> MetricSummary {
        MetricSummary {
            p50_us: self.percentile(50.0),
            p95_us: self.percentile(95.0),
            p99_us: self.percentile(99.0),
            max_us: self.max_us,
            mean_us: if self.total == 0 { 0.0 } else { self.sum_us / self.total as f64 },
            count: self.total,
        }
    }
}

pub struct MetricsRegistry {
    histograms: Mutex<HashMap<&'static str, Histogram>>,
    window: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_window(WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            histograms: Mutex::new(HashMap::new()),
            window: window.max(1),
        }
    }

    /// Record a sample in microseconds.
    pub fn record(&self, name: &'static str, value_us: f64) {
        self.histograms
            .lock()
            .entry(name)
            .or_insert_with(|| Histogram::new(self.window))
            .push(value_us);
        tracing::trace!(metric = name, value_us, "metric_recorded");
    }

    pub fn record_duration(&self, name: &'static str, elapsed: Duration) {
        self.record(name, elapsed.as_micros() as f64);
    }

    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan {
            name,
            start: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    /// Percentile (0-100) in microseconds; 0 for unknown metrics.
    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        self.histograms
            .lock()
            .get(name)
            .map(|h| h.percentile(p))
            .unwrap_or(0.0)
    }

    /// Every metric by name, sorted.
    pub fn summary(&self) -> BTreeMap<String, MetricSummary> {
        self.histograms
            .lock()
            .iter()
            .map(|(name, h)| (name.to_string(), h.summary()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub max_us: f64,
    pub mean_us: f64,
    /// Lifetime sample count, not capped by the window.
    pub count: u64,
}

/// Metric names recorded by the dispatcher.
pub mod metric_names {
    /// Time a job spent queued before a worker took it.
    pub const QUEUE_WAIT: &str = "queue_wait";
    pub const BACKEND_COMPLETE: &str = "t_backend_complete";
    pub const RUN_TOTAL: &str = "t_run_total";
}
