//! Adaptive concurrency for one worker type, driven by the health zone.
//!
//! Fast down, slow up: a critical reading drops straight to the floor, a
//! warning reading halves the ceiling after a short cooldown, and recovery
//! climbs back in steps of half the current level after a long cooldown.
//! Unknown (stale) health counts as warning.

use crate::health::{HealthSource, Zone};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Minimum time between two downward adjustments outside the critical zone.
pub const SCALE_DOWN_COOLDOWN: Duration = Duration::from_secs(60);
/// Minimum time between a change and the next upward step.
pub const SCALE_UP_COOLDOWN: Duration = Duration::from_secs(300);

/// Share of `max` allowed in the warning zone.
const WARNING_FACTOR: f64 = 0.5;
/// Largest upward step, as a share of the current level.
const SCALE_UP_FACTOR: f64 = 0.5;

/// Bounds and enablement for one worker type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    pub enabled: bool,
    pub min: usize,
    pub max: usize,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min: 1,
            max: 10,
        }
    }
}

impl ScalerConfig {
    pub fn new(enabled: bool, min: usize, max: usize) -> Self {
        Self { enabled, min, max }.normalized()
    }

    /// `min` at least 1, `max` at least `min`.
    pub fn normalized(self) -> Self {
        let min = self.min.max(1);
        Self {
            enabled: self.enabled,
            min,
            max: self.max.max(min),
        }
    }

    /// Level allowed in `zone`.
    pub fn target_for(&self, zone: Zone) -> usize {
        match zone {
            Zone::Critical => self.min,
            Zone::Warning => ((self.max as f64 * WARNING_FACTOR).floor() as usize).max(self.min),
            Zone::Safe => self.max,
        }
    }
}

/// Current level, when it last changed, and how often it has changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalerState {
    pub current: usize,
    pub last_adjustment: Instant,
    pub adjustments: u64,
}

struct Inner {
    config: ScalerConfig,
    state: ScalerState,
}

/// Decides how many jobs a worker type may run per batch.
pub struct ConcurrencyScaler {
    worker_type: String,
    health: Arc<dyn HealthSource>,
    inner: Mutex<Inner>,
    current_gauge: Gauge<u64>,
    adjustments: Counter<u64>,
    throttled: Counter<u64>,
}

impl ConcurrencyScaler {
    /// Start optimistic at `max`; the first unhealthy reading throttles down.
    pub fn new(
        worker_type: impl Into<String>,
        health: Arc<dyn HealthSource>,
        config: ScalerConfig,
    ) -> Self {
        let config = config.normalized();
        let scaler = Self {
            worker_type: worker_type.into(),
            health,
            inner: Mutex::new(Inner {
                config,
                state: ScalerState {
                    current: config.max,
                    last_adjustment: Instant::now(),
                    adjustments: 0,
                },
            }),
            current_gauge: metrics::current_concurrency(),
            adjustments: metrics::concurrency_adjustments(),
            throttled: metrics::jobs_throttled(),
        };
        scaler.record_level(config.max);
        scaler
    }

    pub fn worker_type(&self) -> &str {
        &self.worker_type
    }

    pub fn config(&self) -> ScalerConfig {
        self.lock().config
    }

    pub fn state(&self) -> ScalerState {
        self.lock().state
    }

    /// Allowed concurrency for the next batch.
    ///
    /// Disabled scalers return `static_fallback` untouched.
    pub fn get_concurrency(&self, static_fallback: usize) -> usize {
        let mut inner = self.lock();
        if !inner.config.enabled {
            return static_fallback;
        }

        let health = self.health.health();
        let zone = if health.stale {
            Zone::Warning
        } else {
            health.zone
        };

        let config = inner.config;
        let current = inner.state.current;
        let target = config.target_for(zone);
        let since = inner.state.last_adjustment.elapsed();

        let next = if target < current {
            if zone == Zone::Critical || since >= SCALE_DOWN_COOLDOWN {
                target
            } else {
                current
            }
        } else if target > current {
            if since >= SCALE_UP_COOLDOWN {
                let step = ((current as f64 * SCALE_UP_FACTOR).floor() as usize).max(1);
                current.saturating_add(step).min(target)
            } else {
                current
            }
        } else {
            current
        };
        let next = next.clamp(config.min, config.max);

        if next != current {
            let reason = if health.stale { "stale" } else { zone.as_str() };
            self.adjust(&mut inner.state, next, reason);
        }

        if next < config.max {
            self.throttled
                .add(1, &[KeyValue::new("worker_type", self.worker_type.clone())]);
        }

        next
    }

    /// Replace bounds and enablement at runtime. Cooldowns keep running
    /// from the last adjustment.
    pub fn update_config(&self, enabled: bool, min: usize, max: usize) {
        let config = ScalerConfig::new(enabled, min, max);
        let mut inner = self.lock();
        let previous = inner.config;
        inner.config = config;

        let clamped = inner.state.current.clamp(config.min, config.max);
        if clamped != inner.state.current {
            self.adjust(&mut inner.state, clamped, "config");
        }

        info!(
            worker_type = %self.worker_type,
            enabled,
            min = config.min,
            max = config.max,
            previous_min = previous.min,
            previous_max = previous.max,
            current = clamped,
            "scaler config updated"
        );
    }

    fn adjust(&self, state: &mut ScalerState, to: usize, reason: &'static str) {
        let from = state.current;
        state.current = to;
        state.last_adjustment = Instant::now();
        state.adjustments += 1;

        let direction = if to < from { "down" } else { "up" };
        self.adjustments.add(
            1,
            &[
                KeyValue::new("worker_type", self.worker_type.clone()),
                KeyValue::new("direction", direction),
                KeyValue::new("reason", reason),
            ],
        );
        self.record_level(to);

        if to < from {
            warn!(worker_type = %self.worker_type, from, to, reason, "concurrency scaled down");
        } else {
            info!(worker_type = %self.worker_type, from, to, reason, "concurrency scaled up");
        }
    }

    fn record_level(&self, level: usize) {
        debug!(worker_type = %self.worker_type, level, "concurrency level");
        self.current_gauge.record(
            level as u64,
            &[KeyValue::new("worker_type", self.worker_type.clone())],
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
