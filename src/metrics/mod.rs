//! Metrics collection for observability

use prometheus::{
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_vec_with_registry, Counter, CounterVec, HistogramVec, Opts, Registry,
};
use once_cell::sync::Lazy;
use std::sync::Arc;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    Arc::new(Metrics::new().expect("Failed to initialize metrics"))
});

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Fact store
    pub facts_committed: Counter,
    pub provenance_merges: Counter,
    pub version_conflicts: Counter,
    pub schema_violations: Counter,

    // Ontology
    pub schema_activations: Counter,
    pub curation_flags: Counter,

    // Truth maintenance
    pub ingest_outcomes: CounterVec,
    pub conflicts: CounterVec,

    // Query engine
    pub queries: CounterVec,
    pub query_duration: HistogramVec,

    // Embeddings
    pub embeddings_indexed: Counter,

    // Working memory
    pub memory_stage: CounterVec,
    pub memory_evictions: Counter,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let facts_committed = register_counter_with_registry!(
            Opts::new("facts_committed_total", "Fact versions committed"),
            registry
        )?;

        let provenance_merges = register_counter_with_registry!(
            Opts::new("provenance_merges_total", "Sources merged into existing facts"),
            registry
        )?;

        let version_conflicts = register_counter_with_registry!(
            Opts::new("version_conflicts_total", "Commits rejected by a stale head"),
            registry
        )?;

        let schema_violations = register_counter_with_registry!(
            Opts::new("schema_violations_total", "Writes rejected by the active ontology"),
            registry
        )?;

        let schema_activations = register_counter_with_registry!(
            Opts::new("schema_activations_total", "Ontology versions activated"),
            registry
        )?;

        let curation_flags = register_counter_with_registry!(
            Opts::new("curation_flags_total", "Facts flagged by curation sweeps"),
            registry
        )?;

        let ingest_outcomes = register_counter_vec_with_registry!(
            Opts::new("ingest_outcomes_total", "Candidate ingestion outcomes"),
            &["outcome"],
            registry
        )?;

        let conflicts = register_counter_vec_with_registry!(
            Opts::new("conflicts_total", "Conflict records by status"),
            &["status"],
            registry
        )?;

        let queries = register_counter_vec_with_registry!(
            Opts::new("queries_total", "Queries by completion status"),
            &["status"],
            registry
        )?;

        let query_duration = register_histogram_vec_with_registry!(
            "query_duration_seconds",
            "Query evaluation time in seconds",
            &["kind"],
            registry
        )?;

        let embeddings_indexed = register_counter_with_registry!(
            Opts::new("embeddings_indexed_total", "Embeddings added to the index"),
            registry
        )?;

        let memory_stage = register_counter_vec_with_registry!(
            Opts::new("memory_stage_total", "Working memory staging outcomes"),
            &["outcome"],
            registry
        )?;

        let memory_evictions = register_counter_with_registry!(
            Opts::new("memory_evictions_total", "Working memory items evicted"),
            registry
        )?;

        Ok(Self {
            registry,
            facts_committed,
            provenance_merges,
            version_conflicts,
            schema_violations,
            schema_activations,
            curation_flags,
            ingest_outcomes,
            conflicts,
            queries,
            query_duration,
            embeddings_indexed,
            memory_stage,
            memory_evictions,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_ingest(&self, outcome: &str) {
        self.ingest_outcomes.with_label_values(&[outcome]).inc();
    }

    pub fn record_conflict(&self, status: &str) {
        self.conflicts.with_label_values(&[status]).inc();
    }

    pub fn record_query(&self, status: &str) {
        self.queries.with_label_values(&[status]).inc();
    }

    pub fn record_stage(&self, outcome: &str, evicted: usize) {
        self.memory_stage.with_label_values(&[outcome]).inc();
        if evicted > 0 {
            self.memory_evictions.inc_by(evicted as f64);
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();

        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Helper macro to time operations
#[macro_export]
macro_rules! time_operation {
    ($histogram:expr, $label:expr, $operation:expr) => {{
        let timer = $histogram.with_label_values(&[$label]).start_timer();
        let result = $operation;
        timer.observe_duration();
        result
    }};
}
