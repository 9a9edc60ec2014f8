use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    jobs_started: CounterVec,
    job_requests: CounterVec,
    job_request_seconds: HistogramVec,
    group_outcomes: CounterVec,
    merged_rows: CounterVec,
    buckets_received: CounterVec,
    close_context_requests: CounterVec,
    operations_running: GaugeVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn inc_jobs_started(&self, mode: &str) {
        self.inner.jobs_started.with_label_values(&[mode]).inc();
    }

    pub fn record_job_request(&self, node: &str, mode: &str, outcome: &str, secs: f64) {
        self.inner
            .job_requests
            .with_label_values(&[node, mode, outcome])
            .inc();
        self.inner
            .job_request_seconds
            .with_label_values(&[node, mode])
            .observe(secs.max(0.0));
    }

    /// `outcome` is `"success"` or the failing error kind.
    pub fn record_group_outcome(&self, operation: &str, outcome: &str) {
        self.inner
            .group_outcomes
            .with_label_values(&[operation, outcome])
            .inc();
    }

    pub fn record_merged_rows(&self, operation: &str, rows: u64) {
        self.inner
            .merged_rows
            .with_label_values(&[operation])
            .inc_by(rows as f64);
    }

    pub fn inc_buckets_received(&self, delivery: &str) {
        self.inner
            .buckets_received
            .with_label_values(&[delivery])
            .inc();
    }

    pub fn record_close_context(&self, node: &str, outcome: &str) {
        self.inner
            .close_context_requests
            .with_label_values(&[node, outcome])
            .inc();
    }

    pub fn operation_started(&self, operation: &str) {
        self.inner
            .operations_running
            .with_label_values(&[operation])
            .inc();
    }

    pub fn operation_finished(&self, operation: &str) {
        self.inner
            .operations_running
            .with_label_values(&[operation])
            .dec();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let jobs_started = counter_vec(
            &registry,
            "fanout_jobs_started_total",
            "Jobs started by the coordinator",
            &["mode"],
        );
        let job_requests = counter_vec(
            &registry,
            "fanout_job_requests_total",
            "Job requests sent to nodes",
            &["node", "mode", "outcome"],
        );
        let job_request_seconds = histogram_vec(
            &registry,
            "fanout_job_request_seconds",
            "Job request round-trip time",
            &["node", "mode"],
        );
        let group_outcomes = counter_vec(
            &registry,
            "fanout_group_outcomes_total",
            "Resolved result slots by outcome",
            &["operation", "outcome"],
        );
        let merged_rows = counter_vec(
            &registry,
            "fanout_merged_rows_total",
            "Rows produced by final merges",
            &["operation"],
        );
        let buckets_received = counter_vec(
            &registry,
            "fanout_buckets_received_total",
            "Buckets supplied into merge stages",
            &["delivery"],
        );
        let close_context_requests = counter_vec(
            &registry,
            "fanout_close_context_requests_total",
            "Close-context requests issued after job failure",
            &["node", "outcome"],
        );
        let operations_running = gauge_vec(
            &registry,
            "fanout_operations_running",
            "Operations currently tracked",
            &["operation"],
        );

        Self {
            registry,
            jobs_started,
            job_requests,
            job_request_seconds,
            group_outcomes,
            merged_rows,
            buckets_received,
            close_context_requests,
            operations_running,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
