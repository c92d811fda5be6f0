//! Metric instrument factories for jobgate.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Components call these once at construction and keep the instruments,
//! so independent instances never share state through module globals.

use opentelemetry::metrics::{Counter, Gauge, Meter};

/// Returns the shared meter for jobgate instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("jobgate")
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Counter: queue-level operations (dequeue, mark_completed, recover_stale, ...).
/// Labels: `table`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("jobgate.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: job status transitions.
/// Labels: `table`, `from`, `to`.
pub fn queue_transitions() -> Counter<u64> {
    meter()
        .u64_counter("jobgate.queue.transitions")
        .with_description("Number of job status transitions")
        .build()
}

/// Counter: rows claimed by dequeue.
/// Labels: `table`.
pub fn queue_claimed() -> Counter<u64> {
    meter()
        .u64_counter("jobgate.queue.claimed")
        .with_description("Number of jobs claimed by dequeue")
        .build()
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Gauge: composite health score, 0 (saturated) to 100 (idle).
/// Labels: `zone`.
pub fn health_score() -> Gauge<u64> {
    meter()
        .u64_gauge("jobgate.system.health_score")
        .with_description("Composite resource-pressure score")
        .build()
}

/// Gauge: I/O wait as a percentage of CPU time since the previous sample.
pub fn io_wait_percent() -> Gauge<f64> {
    meter()
        .f64_gauge("jobgate.system.io_wait_percent")
        .with_description("Instantaneous I/O wait percentage")
        .with_unit("%")
        .build()
}

/// Gauge: load average.
/// Labels: `period` ("1m" | "5m" | "15m").
pub fn cpu_load_avg() -> Gauge<f64> {
    meter()
        .f64_gauge("jobgate.system.cpu_load_avg")
        .with_description("System load average")
        .build()
}

/// Gauge: memory used as a percentage of total.
pub fn memory_utilization_percent() -> Gauge<f64> {
    meter()
        .f64_gauge("jobgate.system.memory_utilization_percent")
        .with_description("Memory utilization")
        .with_unit("%")
        .build()
}

/// Gauge: in-use connections as a percentage of the pool maximum.
pub fn db_pool_utilization_percent() -> Gauge<f64> {
    meter()
        .f64_gauge("jobgate.system.db_pool_utilization_percent")
        .with_description("Database pool utilization")
        .with_unit("%")
        .build()
}

/// Counter: failed signal collections.
/// Labels: `signal`.
pub fn collection_failures() -> Counter<u64> {
    meter()
        .u64_counter("jobgate.system.collection_failures")
        .with_description("Number of failed health signal collections")
        .build()
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// Gauge: allowed concurrency per worker type.
/// Labels: `worker_type`.
pub fn current_concurrency() -> Gauge<u64> {
    meter()
        .u64_gauge("jobgate.worker.current_concurrency")
        .with_description("Allowed concurrency for a worker type")
        .build()
}

/// Counter: concurrency level changes.
/// Labels: `worker_type`, `direction` ("up" | "down"), `reason` (zone name).
pub fn concurrency_adjustments() -> Counter<u64> {
    meter()
        .u64_counter("jobgate.worker.concurrency_adjustments")
        .with_description("Number of concurrency adjustments")
        .build()
}

/// Counter: batches sized below the configured maximum.
/// Labels: `worker_type`.
pub fn jobs_throttled() -> Counter<u64> {
    meter()
        .u64_counter("jobgate.worker.jobs_throttled")
        .with_description("Number of throttled processing batches")
        .build()
}

/// Counter: harness ticks that invoked the processing callback.
/// Labels: `worker`, `result` ("ok" | "error").
pub fn worker_ticks() -> Counter<u64> {
    meter()
        .u64_counter("jobgate.worker.ticks")
        .with_description("Number of processing callback invocations")
        .build()
}
