//! Span helpers for harness ticks and job transitions.

use tracing::Span;

/// Start a span for one harness tick.
///
/// The `worker.outcome` field is declared empty and can be filled via
/// [`record_tick_outcome`].
pub fn start_tick_span(worker: &str, tick: u64) -> Span {
    tracing::info_span!(
        "worker.tick",
        "worker.name" = worker,
        "worker.tick" = tick,
        "worker.outcome" = tracing::field::Empty,
    )
}

/// Record how a tick ended ("ok" or "error").
pub fn record_tick_outcome(span: &Span, outcome: &str) {
    span.record("worker.outcome", outcome);
}

/// Record a job status transition event on the current span.
pub fn record_job_transition(table: &str, id: &str, from: &str, to: &str) {
    tracing::debug!(table, job.id = id, from, to, "job_transition");
}
