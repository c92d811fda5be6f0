//! Background health collector.
//!
//! One task samples the probes on a fixed interval and swaps in a complete
//! new snapshot under a short write lock. Readers take a read lock, copy the
//! snapshot out, and evaluate staleness on their copy.

use super::{
    HealthConfig, HealthMetrics, HealthSource, PoolStatsSource, Readings, SystemProbe, Zone,
    cpu_load_percent, io_wait_percent,
};
use crate::error::{Error, Result};
use crate::health::probe::CpuTimes;
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consecutive failed cycles before the monitor logs at error level.
const ESCALATE_AFTER_FAILURES: u32 = 3;

/// Stored snapshot plus the instant it was collected.
struct Snapshot {
    metrics: HealthMetrics,
    collected: Option<Instant>,
}

/// State carried between collection cycles.
#[derive(Default)]
struct CollectorState {
    previous_cpu: Option<CpuTimes>,
    readings: Readings,
    zone: Option<Zone>,
}

struct Instruments {
    score: Gauge<u64>,
    io_wait: Gauge<f64>,
    load: Gauge<f64>,
    memory: Gauge<f64>,
    db_pool: Gauge<f64>,
    failures: Counter<u64>,
}

impl Instruments {
    fn new() -> Self {
        Self {
            score: metrics::health_score(),
            io_wait: metrics::io_wait_percent(),
            load: metrics::cpu_load_avg(),
            memory: metrics::memory_utilization_percent(),
            db_pool: metrics::db_pool_utilization_percent(),
            failures: metrics::collection_failures(),
        }
    }

    fn record(&self, snapshot: &HealthMetrics) {
        let r = &snapshot.readings;
        self.score.record(
            u64::from(snapshot.score),
            &[KeyValue::new("zone", snapshot.zone.as_str())],
        );
        self.io_wait.record(r.io_wait_percent, &[]);
        self.load
            .record(r.load_average.one, &[KeyValue::new("period", "1m")]);
        self.load
            .record(r.load_average.five, &[KeyValue::new("period", "5m")]);
        self.load
            .record(r.load_average.fifteen, &[KeyValue::new("period", "15m")]);
        self.memory.record(r.memory_percent, &[]);
        self.db_pool.record(r.db_pool_percent, &[]);
    }
}

struct Inner {
    config: HealthConfig,
    probe: Arc<dyn SystemProbe>,
    pool: Option<Arc<dyn PoolStatsSource>>,
    snapshot: RwLock<Snapshot>,
    collector: tokio::sync::Mutex<CollectorState>,
    consecutive_failures: AtomicU32,
    instruments: Instruments,
}

/// Samples host and pool pressure and publishes a scored snapshot.
pub struct HealthMonitor {
    inner: Arc<Inner>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, probe: Arc<dyn SystemProbe>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                probe,
                pool: None,
                snapshot: RwLock::new(Snapshot {
                    metrics: HealthMetrics::uncollected(),
                    collected: None,
                }),
                collector: tokio::sync::Mutex::new(CollectorState::default()),
                consecutive_failures: AtomicU32::new(0),
                instruments: Instruments::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Include connection-pool utilization as the database signal.
    /// Without a pool source that signal reads 0.
    ///
    /// Must be called before the monitor is shared.
    pub fn with_pool(mut self, pool: Arc<dyn PoolStatsSource>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.pool = Some(pool);
        } else {
            warn!("health monitor already shared, pool source ignored");
        }
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.inner.config
    }

    /// Cycles in a row in which at least one signal failed to collect.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run one collection cycle now and return the resulting snapshot.
    pub async fn collect_once(&self) -> HealthMetrics {
        self.inner.collect().await;
        self.inner.read()
    }
}

#[async_trait]
impl HealthSource for HealthMonitor {
    async fn start(&self) {
        if self.is_running() {
            debug!("health monitor already running");
            return;
        }

        self.inner.collect().await;

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let period = inner.config.interval;
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => collect_guarded(&inner).await,
                }
            }
            debug!("health collection loop exited");
        });

        *task = Some((cancel, handle));
        info!(
            interval_ms = self.inner.config.interval.as_millis() as u64,
            "health monitor started"
        );
    }

    async fn stop(&self, timeout: Duration) -> bool {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some((cancel, handle)) = task else {
            return true;
        };

        cancel.cancel();
        match tokio::time::timeout(timeout, handle).await {
            Ok(_) => {
                info!("health monitor stopped");
                true
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "health monitor did not stop before deadline"
                );
                false
            }
        }
    }

    fn health(&self) -> HealthMetrics {
        self.inner.read()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            cancel.cancel();
        }
    }
}

/// One cycle on its own task, so a panicking signal reader costs a cycle, not the loop.
async fn collect_guarded(inner: &Arc<Inner>) {
    let cycle = Arc::clone(inner);
    match tokio::spawn(async move { cycle.collect().await }).await {
        Ok(()) => {}
        Err(e) if e.is_panic() => {
            let count = inner.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            error!(consecutive_failures = count, "health collection panicked, using last known values");
        }
        Err(e) => error!("health collection aborted: {e}"),
    }
}

impl Inner {
    fn read(&self) -> HealthMetrics {
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        let mut metrics = snapshot.metrics.clone();
        metrics.stale = match snapshot.collected {
            Some(at) => at.elapsed() > self.config.stale_after,
            None => true,
        };
        metrics
    }

    async fn collect(&self) {
        let mut state = self.collector.lock().await;
        let deadline = Instant::now() + self.config.collection_timeout;
        let mut failures: Vec<Error> = Vec::new();
        let mut fresh = 0;

        match bounded(deadline, "load_average", self.probe.load_average()).await {
            Ok(load) => {
                state.readings.load_average = load;
                state.readings.cpu_load_percent =
                    cpu_load_percent(load.one, self.probe.cpu_count());
                fresh += 1;
            }
            Err(e) => failures.push(e),
        }

        match bounded(deadline, "cpu_times", self.probe.cpu_times()).await {
            Ok(current) => {
                state.readings.io_wait_percent = io_wait_percent(state.previous_cpu, current);
                state.previous_cpu = Some(current);
                fresh += 1;
            }
            Err(e) => failures.push(e),
        }

        match bounded(deadline, "memory", self.probe.memory_used_percent()).await {
            Ok(percent) => {
                state.readings.memory_percent = percent;
                fresh += 1;
            }
            Err(e) => failures.push(e),
        }

        state.readings.db_pool_percent = self
            .pool
            .as_ref()
            .and_then(|pool| pool.pool_stats())
            .map(|stats| stats.utilization_percent())
            .unwrap_or(0.0);

        self.note_failures(&failures);

        let metrics = HealthMetrics::evaluate(state.readings, &self.config.thresholds);

        match state.zone {
            Some(previous) if previous != metrics.zone => {
                if metrics.zone == Zone::Safe {
                    info!(from = %previous, to = %metrics.zone, score = metrics.score, "health zone changed");
                } else {
                    warn!(from = %previous, to = %metrics.zone, score = metrics.score, "health zone changed");
                }
            }
            _ => {}
        }
        state.zone = Some(metrics.zone);

        self.instruments.record(&metrics);
        debug!(
            score = metrics.score,
            zone = %metrics.zone,
            io_wait = metrics.readings.io_wait_percent,
            cpu_load = metrics.readings.cpu_load_percent,
            memory = metrics.readings.memory_percent,
            db_pool = metrics.readings.db_pool_percent,
            "health collected"
        );

        // With every host signal failing the timestamp stays put, so the
        // snapshot ages into staleness instead of looking fresh.
        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        if fresh > 0 {
            snapshot.metrics = metrics;
            snapshot.collected = Some(Instant::now());
        } else {
            snapshot.metrics = HealthMetrics {
                collected_at: snapshot.metrics.collected_at,
                ..metrics
            };
        }
    }

    fn note_failures(&self, failures: &[Error]) {
        if failures.is_empty() {
            let previous = self.consecutive_failures.swap(0, Ordering::Relaxed);
            if previous > 0 {
                info!(failed_cycles = previous, "health collection recovered");
            }
            return;
        }

        for failure in failures {
            let signal = match failure {
                Error::Collection { signal, .. } | Error::CollectionTimeout(signal) => *signal,
                _ => "unknown",
            };
            self.instruments
                .failures
                .add(1, &[KeyValue::new("signal", signal)]);
        }

        let count = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let detail = failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        if count >= ESCALATE_AFTER_FAILURES {
            error!(
                consecutive_failures = count,
                errors = %detail,
                "health collection failing repeatedly, using last known values"
            );
        } else {
            warn!(
                consecutive_failures = count,
                errors = %detail,
                "health collection failed, using last known values"
            );
        }
    }
}

async fn bounded<T>(
    deadline: Instant,
    signal: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result.map_err(|e| match e {
            e @ (Error::Collection { .. } | Error::CollectionTimeout(_)) => e,
            other => Error::collection(signal, other),
        }),
        Err(_) => Err(Error::CollectionTimeout(signal)),
    }
}
