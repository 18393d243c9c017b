//! Prometheus metrics for the tailing engine and the processing pipeline.
//!
//! All metrics use the default Prometheus registry and follow naming conventions:
//! - Histograms: *_seconds (for latency)
//! - Counters: *_total (for counts)

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter,
    IntCounterVec,
};

lazy_static! {
    // ==================== TAILING ====================
    pub static ref LINES_READ_TOTAL: IntCounterVec = register_int_counter_vec!(
        "lf_agent_lines_read_total",
        "Lines read from tailed files by input",
        &["input"]
    )
    .unwrap();
    pub static ref READ_PASSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "lf_agent_read_passes_total",
        "Debounced read passes by outcome",
        &["status"]
    )
    .unwrap();
    pub static ref WATCHER_EVENTS_DROPPED_TOTAL: IntCounter = register_int_counter!(
        "lf_agent_watcher_events_dropped_total",
        "File events dropped because the watcher channel was full"
    )
    .unwrap();
    pub static ref STATE_PERSIST_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "lf_agent_state_persist_errors_total",
        "File state repository write failures",
        &["operation"]
    )
    .unwrap();

    // ==================== PIPELINE ====================
    pub static ref EVENTS_INGESTED_TOTAL: IntCounter = register_int_counter!(
        "lf_agent_events_ingested_total",
        "Events received by the ingestion worker"
    )
    .unwrap();
    pub static ref EVENTS_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "lf_agent_events_dropped_total",
        "Events dropped in the filter chain by reason",
        &["reason"]
    )
    .unwrap();
    pub static ref PARSE_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "lf_agent_parse_failures_total",
        "Events no registered parser could parse"
    )
    .unwrap();
    pub static ref OUTPUT_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "lf_agent_output_errors_total",
        "Output write or flush failures by output",
        &["output", "operation"]
    )
    .unwrap();
    pub static ref FLUSH_DURATION: Histogram = register_histogram!(
        "lf_agent_flush_duration_seconds",
        "Time spent writing one buffered batch to every output",
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .unwrap();
}
