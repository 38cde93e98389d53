//! Prometheus metrics for the relay.
//!
//! Provides metric initialization and helper functions for recording pipeline progress.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use zkbridge_types::{FailureKind, Stage};

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns a handle that can be used to render metrics for the `/metrics` endpoint.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_counter!("zkbridge_events_observed_total", "Lock events received from the watcher");
    describe_counter!(
        "zkbridge_events_duplicate_total",
        "Lock events dropped as duplicates, by reason"
    );
    describe_counter!("zkbridge_stage_transitions_total", "Job stage transitions");
    describe_counter!("zkbridge_jobs_finished_total", "Jobs reaching a terminal stage");
    describe_counter!("zkbridge_retries_total", "Failed attempts that are retried");
    describe_counter!("zkbridge_malformed_logs_total", "Source logs that could not be decoded");

    describe_histogram!(
        "zkbridge_proof_duration_seconds",
        "Proof generation time in seconds"
    );
    describe_histogram!(
        "zkbridge_mint_duration_seconds",
        "Mint submission until confirmation in seconds"
    );
    describe_histogram!(
        "zkbridge_total_duration_seconds",
        "Observation until confirmation in seconds"
    );

    describe_gauge!("zkbridge_jobs_in_flight", "Jobs admitted and not yet finished");
    describe_gauge!("zkbridge_source_cursor", "Next source block the watcher scans");

    Ok(handle)
}

pub(crate) fn record_observed() {
    counter!("zkbridge_events_observed_total").increment(1);
}

/// Record a dropped duplicate (`coalesced` or `terminal`).
pub(crate) fn record_duplicate(reason: &'static str) {
    counter!("zkbridge_events_duplicate_total", "reason" => reason).increment(1);
}

pub(crate) fn record_transition(stage: Stage) {
    counter!("zkbridge_stage_transitions_total", "stage" => stage.to_string()).increment(1);
}

/// Record a terminal outcome; `failure` is `None` for confirmed jobs.
pub(crate) fn record_finished(failure: Option<FailureKind>) {
    let outcome = failure.map_or_else(|| "confirmed".to_string(), |kind| kind.to_string());
    counter!("zkbridge_jobs_finished_total", "outcome" => outcome).increment(1);
}

pub(crate) fn record_retry(kind: FailureKind) {
    counter!("zkbridge_retries_total", "kind" => kind.to_string()).increment(1);
}

pub(crate) fn record_malformed_log() {
    counter!("zkbridge_malformed_logs_total").increment(1);
}

/// Record the timing report of a confirmed job.
pub(crate) fn record_timings(proof: Duration, mint: Duration, total: Duration) {
    histogram!("zkbridge_proof_duration_seconds").record(proof.as_secs_f64());
    histogram!("zkbridge_mint_duration_seconds").record(mint.as_secs_f64());
    histogram!("zkbridge_total_duration_seconds").record(total.as_secs_f64());
}

pub(crate) fn set_in_flight(count: usize) {
    gauge!("zkbridge_jobs_in_flight").set(count as f64);
}

pub(crate) fn set_source_cursor(block: u64) {
    gauge!("zkbridge_source_cursor").set(block as f64);
}
