use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all reindex metrics
const PREFIX: &str = "search_reindex";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Page Metrics
    pub static ref PAGES_COMPLETED_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_pages_completed_total"),
        "Total query pages completed"
    ).expect("Failed to create pages_completed_total metric");

    pub static ref PAGE_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_page_failures_total"), "Failed page attempts by outcome"),
        &["outcome"]
    ).expect("Failed to create page_failures_total metric");

    pub static ref STALE_REQUEUES_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_stale_requeues_total"),
        "Running pages demoted back to queued after a missed heartbeat"
    ).expect("Failed to create stale_requeues_total metric");

    pub static ref PAGE_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            format!("{PREFIX}_page_duration_seconds"),
            "Time spent querying and applying one page"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0])
    ).expect("Failed to create page_duration_seconds metric");

    // Orchestration Metrics
    pub static ref COMMIT_CONFLICTS_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_commit_conflicts_total"),
        "Job commits rejected because of a version conflict"
    ).expect("Failed to create commit_conflicts_total metric");

    pub static ref THROTTLE_DELAY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            format!("{PREFIX}_throttle_delay_seconds"),
            "Delay applied before page claims"
        )
        .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0])
    ).expect("Failed to create throttle_delay_seconds metric");

    pub static ref THROTTLE_ERRORS_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_throttle_errors_total"),
        "Throttle calls that failed and were treated as zero delay"
    ).expect("Failed to create throttle_errors_total metric");

    // Job Metrics
    pub static ref JOBS_FINISHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_finished_total"), "Jobs reaching a terminal status"),
        &["status"]
    ).expect("Failed to create jobs_finished_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(PAGES_COMPLETED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PAGE_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(STALE_REQUEUES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PAGE_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(COMMIT_CONFLICTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(THROTTLE_DELAY_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(THROTTLE_ERRORS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_FINISHED_TOTAL.clone()));

    tracing::debug!("Reindex metrics initialized");
}

/// Record a completed page
pub fn record_page_completed(duration: Duration) {
    PAGES_COMPLETED_TOTAL.inc();
    PAGE_DURATION_SECONDS.observe(duration.as_secs_f64());
}

/// Record a failed page attempt ("retry" or "permanent")
pub fn record_page_failure(outcome: &str) {
    PAGE_FAILURES_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record pages demoted by the stale sweep
pub fn record_stale_requeues(count: usize) {
    STALE_REQUEUES_TOTAL.inc_by(count as u64);
}

pub fn record_commit_conflict() {
    COMMIT_CONFLICTS_TOTAL.inc();
}

/// Record a throttle delay before a claim
pub fn record_throttle_delay(delay: Duration) {
    THROTTLE_DELAY_SECONDS.observe(delay.as_secs_f64());
}

pub fn record_throttle_error() {
    THROTTLE_ERRORS_TOTAL.inc();
}

/// Record a job reaching a terminal status
pub fn record_job_finished(status: &str) {
    JOBS_FINISHED_TOTAL.with_label_values(&[status]).inc();
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => String::from_utf8(buffer).unwrap_or_default(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            String::new()
        }
    }
}
