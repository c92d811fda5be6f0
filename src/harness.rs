//! Polling worker harness: runs a processing callback on a fixed interval
//! until stopped.
//!
//! The harness is queue-agnostic. The callback claims, processes, and
//! retires its own jobs and reports outcomes through [`HarnessCounters`].
//! Ticks never overlap: a slow callback delays the next tick instead of
//! running alongside it.

use crate::error::Result;
use crate::telemetry::metrics;
use crate::telemetry::spans::{record_tick_outcome, start_tick_span};
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_BATCH_SIZE: u32 = 10;
pub const DEFAULT_STALE_THRESHOLD_MINUTES: u32 = 10;

/// Reclaims work orphaned by crashed workers. Implemented by `JobQueue`.
#[async_trait]
pub trait StaleRecovery: Send + Sync {
    /// Reset jobs stuck longer than `threshold_minutes`; returns how many.
    async fn recover_stale(&self, threshold_minutes: u32) -> Result<u64>;
}

/// Configuration for a worker harness.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Label for logs and metrics.
    pub name: String,
    pub poll_interval: Duration,
    /// Handed to the callback; the harness itself does not claim anything.
    pub batch_size: u32,
    pub stale_threshold_minutes: u32,
    pub recover_stale_on_start: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            stale_threshold_minutes: DEFAULT_STALE_THRESHOLD_MINUTES,
            recover_stale_on_start: false,
        }
    }
}

impl HarnessConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn batch_size(mut self, n: u32) -> Self {
        self.batch_size = n;
        self
    }

    pub fn stale_threshold_minutes(mut self, minutes: u32) -> Self {
        self.stale_threshold_minutes = minutes;
        self
    }

    pub fn recover_stale_on_start(mut self, enabled: bool) -> Self {
        self.recover_stale_on_start = enabled;
        self
    }

    /// Zero values fall back to the defaults.
    fn normalized(mut self) -> Self {
        if self.poll_interval.is_zero() {
            self.poll_interval = DEFAULT_POLL_INTERVAL;
        }
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.stale_threshold_minutes == 0 {
            self.stale_threshold_minutes = DEFAULT_STALE_THRESHOLD_MINUTES;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Outcome counters, incremented by the processing callback.
#[derive(Debug, Default)]
pub struct HarnessCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`HarnessCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl HarnessCounters {
    pub fn add_processed(&self, n: u64) {
        self.processed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_succeeded(&self, n: u64) {
        self.succeeded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_failed(&self, n: u64) {
        self.failed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Lifecycle of a harness: `Idle → Running → Stopping → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Handed to the callback on every tick.
#[derive(Clone)]
pub struct TickContext {
    pub batch_size: u32,
    pub counters: Arc<HarnessCounters>,
    /// Cancelled when `stop` is called; long callbacks should watch it.
    pub cancel: CancellationToken,
}

type ProcessFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type ProcessFn = Arc<dyn Fn(TickContext) -> ProcessFuture + Send + Sync>;

struct Lifecycle {
    state: HarnessState,
    /// Bumped on every start so a finished loop only settles its own run.
    generation: u64,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// Moves the lifecycle to `Stopped` when a loop ends, however it ends.
struct ExitGuard {
    lifecycle: Arc<Mutex<Lifecycle>>,
    generation: u64,
    cancel: CancellationToken,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.generation != self.generation {
            return;
        }
        if !self.cancel.is_cancelled() {
            error!("worker loop exited without a stop request");
        }
        if matches!(lifecycle.state, HarnessState::Running | HarnessState::Stopping) {
            lifecycle.state = HarnessState::Stopped;
            lifecycle.cancel = None;
        }
    }
}

/// Runs a processing callback once per poll interval.
pub struct WorkerHarness {
    config: HarnessConfig,
    process: ProcessFn,
    recovery: Option<Arc<dyn StaleRecovery>>,
    counters: Arc<HarnessCounters>,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl WorkerHarness {
    pub fn new<F, Fut>(config: HarnessConfig, process: F) -> Self
    where
        F: Fn(TickContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let process: ProcessFn = Arc::new(move |ctx| Box::pin(process(ctx)));
        Self {
            config: config.normalized(),
            process,
            recovery: None,
            counters: Arc::new(HarnessCounters::default()),
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: HarnessState::Idle,
                generation: 0,
                cancel: None,
                handle: None,
            })),
        }
    }

    /// Reclaim stale jobs through `recovery` before the first tick, if
    /// `recover_stale_on_start` is set.
    pub fn with_recovery(mut self, recovery: Arc<dyn StaleRecovery>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn counters(&self) -> Arc<HarnessCounters> {
        Arc::clone(&self.counters)
    }

    pub fn state(&self) -> HarnessState {
        lock(&self.lifecycle).state
    }

    pub fn is_running(&self) -> bool {
        self.state() == HarnessState::Running
    }

    /// Spawn the polling loop. No-op while running or still stopping.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        match lifecycle.state {
            HarnessState::Running => {
                debug!(worker = %self.config.name, "already running");
                return;
            }
            HarnessState::Stopping => {
                warn!(worker = %self.config.name, "start ignored, previous loop still stopping");
                return;
            }
            HarnessState::Idle | HarnessState::Stopped => {}
        }

        let cancel = CancellationToken::new();
        let recovery = if self.config.recover_stale_on_start {
            self.recovery.clone()
        } else {
            None
        };
        let worker = Loop {
            config: self.config.clone(),
            process: Arc::clone(&self.process),
            recovery,
            ctx: TickContext {
                batch_size: self.config.batch_size,
                counters: Arc::clone(&self.counters),
                cancel: cancel.clone(),
            },
        };

        lifecycle.generation += 1;
        let guard = ExitGuard {
            lifecycle: Arc::clone(&self.lifecycle),
            generation: lifecycle.generation,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            worker.run().await;
        });

        lifecycle.state = HarnessState::Running;
        lifecycle.cancel = Some(cancel);
        lifecycle.handle = Some(handle);
        info!(
            worker = %self.config.name,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "worker started"
        );
    }

    /// Signal the loop to exit and wait up to `timeout` for it to finish.
    ///
    /// Returns `true` once the loop has exited, `false` if the deadline
    /// passed first; the loop then exits on its own at its next safe point.
    /// Idempotent.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let (cancel, handle) = {
            let mut lifecycle = lock(&self.lifecycle);
            match lifecycle.state {
                HarnessState::Running => {
                    lifecycle.state = HarnessState::Stopping;
                    (lifecycle.cancel.take(), lifecycle.handle.take())
                }
                HarnessState::Stopping => return false,
                HarnessState::Idle | HarnessState::Stopped => return true,
            }
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        if let Some(handle) = handle {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(worker = %self.config.name, "worker task ended abnormally: {e}");
                }
                Err(_) => {
                    warn!(
                        worker = %self.config.name,
                        timeout_ms = timeout.as_millis() as u64,
                        "worker did not acknowledge stop before deadline"
                    );
                    return false;
                }
            }
        }

        lock(&self.lifecycle).state = HarnessState::Stopped;
        info!(worker = %self.config.name, "worker stopped");
        true
    }
}

impl Drop for WorkerHarness {
    fn drop(&mut self) {
        if let Some(cancel) = &lock(&self.lifecycle).cancel {
            cancel.cancel();
        }
    }
}

/// Everything the spawned loop owns.
struct Loop {
    config: HarnessConfig,
    process: ProcessFn,
    recovery: Option<Arc<dyn StaleRecovery>>,
    ctx: TickContext,
}

impl Loop {
    async fn run(self) {
        let name = self.config.name.as_str();
        let cancel = self.ctx.cancel.clone();

        if let Some(recovery) = &self.recovery {
            tokio::select! {
                _ = cancel.cancelled() => return,
                result = recovery.recover_stale(self.config.stale_threshold_minutes) => {
                    match result {
                        Ok(n) => info!(worker = name, recovered = n, "startup stale recovery done"),
                        Err(e) => warn!(worker = name, "startup stale recovery failed: {e}"),
                    }
                }
            }
        }

        let ticks = metrics::worker_ticks();
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            // A stop requested while the previous callback ran wins over a due tick.
            if cancel.is_cancelled() {
                break;
            }

            tick += 1;
            let span = start_tick_span(name, tick);
            // Its own task, so a panicking callback costs one tick, not the loop.
            let callback = tokio::spawn((self.process)(self.ctx.clone()).instrument(span.clone()));

            let outcome = match callback.await {
                Ok(Ok(())) => "ok",
                Ok(Err(e)) => {
                    warn!(worker = name, tick, "processing callback failed: {e}");
                    "error"
                }
                Err(e) if e.is_panic() => {
                    error!(worker = name, tick, "processing callback panicked");
                    "error"
                }
                Err(e) => {
                    error!(worker = name, tick, "processing callback aborted: {e}");
                    "error"
                }
            };
            record_tick_outcome(&span, outcome);
            ticks.add(
                1,
                &[
                    KeyValue::new("worker", name.to_string()),
                    KeyValue::new("result", outcome),
                ],
            );
        }

        debug!(worker = name, ticks = tick, "worker loop exited");
    }
}

fn lock(lifecycle: &Mutex<Lifecycle>) -> MutexGuard<'_, Lifecycle> {
    // State updates are single assignments; a poisoned lock still holds a valid state.
    lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_config_values_fall_back_to_defaults() {
        let config = HarnessConfig::new("sync")
            .poll_interval(Duration::ZERO)
            .batch_size(0)
            .stale_threshold_minutes(0)
            .normalized();
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.stale_threshold_minutes, DEFAULT_STALE_THRESHOLD_MINUTES);
    }

    #[test]
    fn counters_snapshot_reflects_increments() {
        let counters = HarnessCounters::default();
        counters.add_processed(5);
        counters.add_succeeded(4);
        counters.add_failed(1);
        assert_eq!(
            counters.snapshot(),
            CounterSnapshot {
                processed: 5,
                succeeded: 4,
                failed: 1
            }
        );
    }
}
