//! Prometheus metrics for monitoring and alerting.
//!
//! NOTE: user_id is intentionally absent from all label sets to avoid
//! high-cardinality explosion.

use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Request Metrics
    // ============================================================================

    /// HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "cortex_http_request_duration_seconds",
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method", "endpoint", "status"]
    ).unwrap();

    /// Total HTTP requests
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("cortex_http_requests_total", "Total HTTP requests"),
        &["method", "endpoint", "status"]
    ).unwrap();

    // ============================================================================
    // Ingestion Metrics
    // ============================================================================

    /// Jobs published to the memory stream
    pub static ref JOBS_SUBMITTED_TOTAL: IntCounter = IntCounter::new(
        "cortex_jobs_submitted_total",
        "Total ingestion jobs published to the stream"
    ).unwrap();

    /// Deliveries processed by the worker pool, by outcome
    pub static ref JOBS_PROCESSED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("cortex_jobs_processed_total", "Total job deliveries by outcome"),
        &["outcome"]  // outcome: "success", "skip", "failure", "malformed"
    ).unwrap();

    /// Jobs currently between dispatch and ack/terminate
    pub static ref ACTIVE_JOBS: IntGauge = IntGauge::new(
        "cortex_active_jobs",
        "Ingestion jobs currently in flight"
    ).unwrap();

    /// End-to-end pipeline duration per job
    pub static ref PIPELINE_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "cortex_pipeline_duration_seconds",
            "Ingestion pipeline duration per job"
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0])
    ).unwrap();

    // ============================================================================
    // Collaborator Metrics
    // ============================================================================

    /// Embedding RPC calls
    pub static ref EMBEDDING_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("cortex_embedding_requests_total", "Total embedding RPC calls"),
        &["result"]
    ).unwrap();

    /// Embedding RPC duration
    pub static ref EMBEDDING_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "cortex_embedding_duration_seconds",
            "Embedding RPC duration"
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0, 30.0])
    ).unwrap();

    /// LLM prompt-program calls
    pub static ref LLM_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("cortex_llm_requests_total", "Total LLM calls"),
        &["program", "result"]  // program: "expand_query" or "plan_actions"
    ).unwrap();

    /// Retries spent inside the LLM backoff loop
    pub static ref LLM_RETRIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("cortex_llm_retries_total", "Total LLM retry attempts"),
        &["program"]
    ).unwrap();

    /// Hybrid vector search duration
    pub static ref VECTOR_SEARCH_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "cortex_vector_search_duration_seconds",
            "Hybrid vector search duration"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0])
    ).unwrap();

    /// Results returned per retrieval, after threshold and merge
    pub static ref RETRIEVE_RESULTS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "cortex_retrieve_results",
            "Memories returned per retrieval request"
        )
        .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0])
    ).unwrap();
}

/// Register all metrics with the global registry.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    METRICS_REGISTRY.register(Box::new(HTTP_REQUEST_DURATION.clone()))?;
    METRICS_REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()))?;

    METRICS_REGISTRY.register(Box::new(JOBS_SUBMITTED_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(JOBS_PROCESSED_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(ACTIVE_JOBS.clone()))?;
    METRICS_REGISTRY.register(Box::new(PIPELINE_DURATION.clone()))?;

    METRICS_REGISTRY.register(Box::new(EMBEDDING_REQUESTS_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(EMBEDDING_DURATION.clone()))?;
    METRICS_REGISTRY.register(Box::new(LLM_REQUESTS_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(LLM_RETRIES_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(VECTOR_SEARCH_DURATION.clone()))?;
    METRICS_REGISTRY.register(Box::new(RETRIEVE_RESULTS.clone()))?;

    Ok(())
}

/// RAII timer that records duration to a histogram on drop.
pub struct Timer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl Timer {
    pub fn new(histogram: Histogram) -> Self {
        Self {
            histogram,
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}
