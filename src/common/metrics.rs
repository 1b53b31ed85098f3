//! Consensus metrics in Prometheus text format
//!
//! Elections, proposals, RPC failures, apply progress and commit latency.
//! Exposed by the master on `GET /metrics`.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for commit latency (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with default latency buckets
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    /// Create a histogram with custom bucket boundaries
    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in the histogram
    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // sum kept in microseconds
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, ending with `+Inf`
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Process-wide consensus metrics
#[derive(Debug)]
pub struct RaftMetrics {
    pub elections_started: Counter,
    pub leader_elections_won: Counter,
    pub step_downs: Counter,
    pub proposals_total: Counter,
    pub proposals_committed: Counter,
    pub proposals_failed: Counter,
    pub rpc_failures: Counter,
    pub entries_applied: Counter,
    pub snapshots_taken: Counter,
    pub snapshots_installed: Counter,
    pub current_term: Gauge,
    pub commit_index: Gauge,
    pub commit_latency: Histogram,
    start_time: Instant,
}

impl RaftMetrics {
    pub fn new() -> Self {
        Self {
            elections_started: Counter::new(),
            leader_elections_won: Counter::new(),
            step_downs: Counter::new(),
            proposals_total: Counter::new(),
            proposals_committed: Counter::new(),
            proposals_failed: Counter::new(),
            rpc_failures: Counter::new(),
            entries_applied: Counter::new(),
            snapshots_taken: Counter::new(),
            snapshots_installed: Counter::new(),
            current_term: Gauge::new(),
            commit_index: Gauge::new(),
            commit_latency: Histogram::new(),
            start_time: Instant::now(),
        }
    }

    /// Record the outcome of one `propose` call
    pub fn record_proposal(&self, duration: Duration, committed: bool) {
        self.proposals_total.inc();
        if committed {
            self.proposals_committed.inc();
            self.commit_latency.observe(duration.as_secs_f64() * 1000.0);
        } else {
            self.proposals_failed.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Render all metrics in Prometheus text exposition format
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = [
            ("elections_started_total", "Elections started", &self.elections_started),
            ("leader_elections_won_total", "Elections won", &self.leader_elections_won),
            ("step_downs_total", "Leader or candidate step-downs", &self.step_downs),
            ("proposals_total", "Commands proposed", &self.proposals_total),
            ("proposals_committed_total", "Commands committed", &self.proposals_committed),
            ("proposals_failed_total", "Commands not committed", &self.proposals_failed),
            ("rpc_failures_total", "Failed peer RPCs", &self.rpc_failures),
            ("entries_applied_total", "Log entries applied", &self.entries_applied),
            ("snapshots_taken_total", "Snapshots taken", &self.snapshots_taken),
            ("snapshots_installed_total", "Snapshots installed from a leader", &self.snapshots_installed),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP tidemaster_{} {}", name, help);
            let _ = writeln!(out, "# TYPE tidemaster_{} counter", name);
            let _ = writeln!(out, "tidemaster_{} {}", name, counter.get());
        }

        let gauges = [
            ("current_term", "Latest term seen", &self.current_term),
            ("commit_index", "Highest committed log index", &self.commit_index),
        ];
        for (name, help, gauge) in gauges {
            let _ = writeln!(out, "# HELP tidemaster_{} {}", name, help);
            let _ = writeln!(out, "# TYPE tidemaster_{} gauge", name);
            let _ = writeln!(out, "tidemaster_{} {}", name, gauge.get());
        }

        out.push_str("# HELP tidemaster_uptime_seconds Process uptime in seconds\n");
        out.push_str("# TYPE tidemaster_uptime_seconds gauge\n");
        let _ = writeln!(out, "tidemaster_uptime_seconds {}", self.uptime_seconds());

        out.push_str("# HELP tidemaster_commit_latency_ms Propose-to-commit latency\n");
        out.push_str("# TYPE tidemaster_commit_latency_ms histogram\n");
        for (le, count) in self.commit_latency.get_buckets() {
            if le.is_infinite() {
                let _ = writeln!(out, "tidemaster_commit_latency_ms_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(out, "tidemaster_commit_latency_ms_bucket{{le=\"{}\"}} {}", le, count);
            }
        }
        let _ = writeln!(out, "tidemaster_commit_latency_ms_sum {}", self.commit_latency.sum());
        let _ = writeln!(out, "tidemaster_commit_latency_ms_count {}", self.commit_latency.count());

        out
    }
}

impl Default for RaftMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<RaftMetrics> =
    once_cell::sync::Lazy::new(RaftMetrics::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();

        hist.observe(5.0);
        hist.observe(50.0);
        hist.observe(50_000.0);

        assert_eq!(hist.count(), 3);

        let buckets = hist.get_buckets();
        assert_eq!(buckets.len(), LATENCY_BUCKETS.len() + 1);
        assert_eq!(buckets.last().unwrap().1, 3);
        // 50_000 only lands in +Inf
        assert_eq!(buckets[buckets.len() - 2].1, 2);
    }

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new();
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);

        let gauge = Gauge::new();
        gauge.set(10);
        assert_eq!(gauge.get(), 10);
    }

    #[test]
    fn test_record_proposal() {
        let metrics = RaftMetrics::new();

        metrics.record_proposal(Duration::from_millis(20), true);
        metrics.record_proposal(Duration::from_millis(5000), false);

        assert_eq!(metrics.proposals_total.get(), 2);
        assert_eq!(metrics.proposals_committed.get(), 1);
        assert_eq!(metrics.proposals_failed.get(), 1);
        assert_eq!(metrics.commit_latency.count(), 1);

        let text = metrics.to_prometheus();
        assert!(text.contains("tidemaster_proposals_committed_total 1"));
        assert!(text.contains("tidemaster_commit_latency_ms_count 1"));
    }
}
