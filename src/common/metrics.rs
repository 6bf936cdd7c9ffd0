//! In-process metrics
//!
//! Latency histograms keyed by dotted operation names (`volplane.volume.list`),
//! a handful of global counters and gauges, and a Prometheus text exporter.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 12] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 30000.0, 300000.0,
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
        // Stored as microseconds for precision
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, ending with the +Inf bucket
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

    /// Sum of all observed values
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
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
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
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics registry shared by a server
#[derive(Debug)]
pub struct MetricsRegistry {
    timings: Mutex<BTreeMap<String, Arc<Histogram>>>,
    pub rpc_requests: Counter,
    pub rpc_forwarded: Counter,
    pub rpc_errors: Counter,
    pub blocking_queries: Gauge,
    pub raft_applied_index: Gauge,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            timings: Mutex::new(BTreeMap::new()),
            rpc_requests: Counter::new(),
            rpc_forwarded: Counter::new(),
            rpc_errors: Counter::new(),
            blocking_queries: Gauge::new(),
            raft_applied_index: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    /// Get or create the histogram for a dotted metric name
    pub fn timing(&self, name: &str) -> Arc<Histogram> {
        let mut timings = self.timings.lock().unwrap_or_else(|e| e.into_inner());
        timings
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::new()))
            .clone()
    }

    /// Record the time elapsed since `start` under the joined name parts
    pub fn measure_since(&self, name_parts: &[&str], start: Instant) {
        self.observe(name_parts, start.elapsed());
    }

    pub fn observe(&self, name_parts: &[&str], elapsed: Duration) {
        self.timing(&name_parts.join("."))
            .observe(elapsed.as_secs_f64() * 1000.0);
    }

    /// Start a timer that records into `name_parts` when dropped
    pub fn timer(self: &Arc<Self>, name_parts: &'static [&'static str]) -> MetricsTimer {
        MetricsTimer {
            registry: Arc::clone(self),
            name_parts,
            start: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();

        let counters = [
            ("volplane_rpc_requests_total", "RPC requests handled", &self.rpc_requests),
            ("volplane_rpc_forwarded_total", "RPC requests forwarded to the leader", &self.rpc_forwarded),
            ("volplane_rpc_errors_total", "RPC requests that returned an error", &self.rpc_errors),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", counter.get());
        }

        let gauges = [
            ("volplane_blocking_queries", "Blocking queries currently waiting", self.blocking_queries.get()),
            ("volplane_raft_applied_index", "Last applied log index", self.raft_applied_index.get()),
            ("volplane_uptime_seconds", "Server uptime in seconds", self.uptime_seconds()),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {value}");
        }

        let timings = self.timings.lock().unwrap_or_else(|e| e.into_inner());
        out.push_str("# HELP volplane_operation_duration_ms Operation duration in milliseconds\n");
        out.push_str("# TYPE volplane_operation_duration_ms histogram\n");
        for (name, hist) in timings.iter() {
            for (le, count) in hist.get_buckets() {
                if le.is_infinite() {
                    let _ = writeln!(
                        out,
                        "volplane_operation_duration_ms_bucket{{op=\"{name}\",le=\"+Inf\"}} {count}"
                    );
                } else {
                    let _ = writeln!(
                        out,
                        "volplane_operation_duration_ms_bucket{{op=\"{name}\",le=\"{le}\"}} {count}"
                    );
                }
            }
            let _ = writeln!(
                out,
                "volplane_operation_duration_ms_sum{{op=\"{name}\"}} {}",
                hist.sum()
            );
            let _ = writeln!(
                out,
                "volplane_operation_duration_ms_count{{op=\"{name}\"}} {}",
                hist.count()
            );
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Records an operation's latency when dropped, whatever the outcome
pub struct MetricsTimer {
    registry: Arc<MetricsRegistry>,
    name_parts: &'static [&'static str],
    start: Instant,
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        self.registry.measure_since(self.name_parts, self.start);
    }
}
