//! Request and replication metrics
//!
//! Prometheus-compatible text output of:
//! - per-endpoint request counters and latency histograms
//! - per-stage counters for the write/delete paths (local disk, replicas)
//! - in-flight gauges for every stage

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

// Stage labels
pub const WRITE_TO_LOCAL_DISK: &str = "write_to_local_disk";
pub const WRITE_TO_REPLICAS: &str = "write_to_replicas";
pub const DELETE_ON_LOCAL_DISK: &str = "delete_on_local_disk";
pub const DELETE_ON_REPLICAS: &str = "delete_on_replicas";
pub const UNMARSHAL_PAIRS: &str = "unmarshal_pairs";
pub const EC_SHARD_COPY: &str = "ec_shard_copy";

#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    /// Sum in microseconds
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        Self {
            buckets: (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect(),
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in milliseconds
    pub fn observe(&self, value: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.boundaries.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, d: Duration) {
        self.observe(d.as_secs_f64() * 1000.0);
    }

    /// Cumulative buckets, `+Inf` last
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            let le = self.boundaries.get(i).copied().unwrap_or(f64::INFINITY);
            result.push((le, cumulative));
        }
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
        Self::default()
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
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters for one stage of the write/delete path.
#[derive(Debug, Default)]
pub struct StageMetrics {
    pub in_flight: Gauge,
    pub errors: Counter,
    pub latency: Histogram,
}

impl StageMetrics {
    /// Track one in-flight call; the gauge drops when the guard does.
    pub fn start(self: &Arc<Self>) -> InFlight {
        self.in_flight.inc();
        InFlight {
            stage: self.clone(),
            started: Instant::now(),
        }
    }
}

/// Guard returned by [`StageMetrics::start`].
pub struct InFlight {
    stage: Arc<StageMetrics>,
    started: Instant,
}

impl InFlight {
    /// Record latency and, on failure, the error counter.
    pub fn finish(self, success: bool) {
        self.stage.latency.observe_duration(self.started.elapsed());
        if !success {
            self.stage.errors.inc();
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.stage.in_flight.dec();
    }
}

#[derive(Debug, Default)]
pub struct EndpointMetrics {
    pub requests_total: Counter,
    pub requests_error: Counter,
    pub latency: Histogram,
}

#[derive(Debug)]
pub struct MetricsRegistry {
    endpoints: Mutex<BTreeMap<String, Arc<EndpointMetrics>>>,
    stages: Mutex<BTreeMap<&'static str, Arc<StageMetrics>>>,

    pub total_requests: Counter,
    pub total_errors: Counter,
    pub bytes_written: Counter,
    pub bytes_freed: Counter,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(BTreeMap::new()),
            stages: Mutex::new(BTreeMap::new()),
            total_requests: Counter::new(),
            total_errors: Counter::new(),
            bytes_written: Counter::new(),
            bytes_freed: Counter::new(),
            start_time: Instant::now(),
        }
    }

    pub fn endpoint(&self, path: &str) -> Arc<EndpointMetrics> {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        endpoints.entry(path.to_string()).or_default().clone()
    }

    pub fn stage(&self, name: &'static str) -> Arc<StageMetrics> {
        let mut stages = self.stages.lock().unwrap_or_else(|e| e.into_inner());
        stages.entry(name).or_default().clone()
    }

    pub fn record_request(&self, path: &str, duration: Duration, success: bool) {
        let endpoint = self.endpoint(path);
        endpoint.requests_total.inc();
        endpoint.latency.observe_duration(duration);
        self.total_requests.inc();
        if !success {
            endpoint.requests_error.inc();
            self.total_errors.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "# TYPE needlefs_requests_total counter");
        let _ = writeln!(out, "needlefs_requests_total {}", self.total_requests.get());
        let _ = writeln!(out, "# TYPE needlefs_errors_total counter");
        let _ = writeln!(out, "needlefs_errors_total {}", self.total_errors.get());
        let _ = writeln!(out, "# TYPE needlefs_bytes_written_total counter");
        let _ = writeln!(out, "needlefs_bytes_written_total {}", self.bytes_written.get());
        let _ = writeln!(out, "# TYPE needlefs_bytes_freed_total counter");
        let _ = writeln!(out, "needlefs_bytes_freed_total {}", self.bytes_freed.get());
        let _ = writeln!(out, "# TYPE needlefs_uptime_seconds gauge");
        let _ = writeln!(out, "needlefs_uptime_seconds {}", self.uptime_seconds());

        let endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(out, "# TYPE needlefs_endpoint_requests_total counter");
        for (path, m) in endpoints.iter() {
            let _ = writeln!(
                out,
                "needlefs_endpoint_requests_total{{path=\"{}\"}} {}",
                path,
                m.requests_total.get()
            );
        }
        let _ = writeln!(out, "# TYPE needlefs_endpoint_errors_total counter");
        for (path, m) in endpoints.iter() {
            let _ = writeln!(
                out,
                "needlefs_endpoint_errors_total{{path=\"{}\"}} {}",
                path,
                m.requests_error.get()
            );
        }
        let _ = writeln!(out, "# TYPE needlefs_request_duration_ms histogram");
        for (path, m) in endpoints.iter() {
            write_histogram(&mut out, "needlefs_request_duration_ms", "path", path, &m.latency);
        }
        drop(endpoints);

        let stages = self.stages.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(out, "# TYPE needlefs_stage_in_flight gauge");
        for (name, m) in stages.iter() {
            let _ = writeln!(
                out,
                "needlefs_stage_in_flight{{stage=\"{}\"}} {}",
                name,
                m.in_flight.get()
            );
        }
        let _ = writeln!(out, "# TYPE needlefs_stage_errors_total counter");
        for (name, m) in stages.iter() {
            let _ = writeln!(
                out,
                "needlefs_stage_errors_total{{stage=\"{}\"}} {}",
                name,
                m.errors.get()
            );
        }
        let _ = writeln!(out, "# TYPE needlefs_stage_duration_ms histogram");
        for (name, m) in stages.iter() {
            write_histogram(&mut out, "needlefs_stage_duration_ms", "stage", name, &m.latency);
        }

        out
    }
}

fn write_histogram(out: &mut String, metric: &str, label: &str, value: &str, h: &Histogram) {
    for (le, count) in h.get_buckets() {
        let le = if le.is_infinite() {
            "+Inf".to_string()
        } else {
            le.to_string()
        };
        let _ = writeln!(
            out,
            "{}_bucket{{{}=\"{}\",le=\"{}\"}} {}",
            metric, label, value, le, count
        );
    }
    let _ = writeln!(out, "{}_sum{{{}=\"{}\"}} {}", metric, label, value, h.sum());
    let _ = writeln!(out, "{}_count{{{}=\"{}\"}} {}", metric, label, value, h.count());
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);
