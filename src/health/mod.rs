//! System health: four pressure signals folded into one 0–100 score and a
//! discrete zone that worker scalers act on.
//!
//! Each signal is scored with a three-step function (0 / 50 / 100) against
//! its warning and critical thresholds, and the weighted penalty is taken
//! off 100. The scaler cooldowns are tuned against these steps.

pub mod monitor;
pub mod probe;

pub use monitor::HealthMonitor;
pub use probe::{CpuTimes, LoadAverage, PoolStats, PoolStatsSource, SysinfoProbe, SystemProbe};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Signal weights, in tenths. They sum to 10.
const IO_WEIGHT: u32 = 4;
const CPU_WEIGHT: u32 = 3;
const DB_WEIGHT: u32 = 2;
const MEM_WEIGHT: u32 = 1;

// ---------------------------------------------------------------------------
// Zone
// ---------------------------------------------------------------------------

/// Discretized health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    Safe,
    Warning,
    Critical,
}

impl Zone {
    /// `≤ 33` critical, `≤ 66` warning, otherwise safe.
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=33 => Zone::Critical,
            34..=66 => Zone::Warning,
            _ => Zone::Safe,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Zone::Safe => "safe",
            Zone::Warning => "warning",
            Zone::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Warning and critical levels for one signal, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warning: f64,
    pub critical: f64,
}

impl Thresholds {
    pub const fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }
}

/// Thresholds for all four signals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub io_wait: Thresholds,
    pub cpu_load: Thresholds,
    pub db_pool: Thresholds,
    pub memory: Thresholds,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            io_wait: Thresholds::new(20.0, 40.0),
            cpu_load: Thresholds::new(70.0, 90.0),
            db_pool: Thresholds::new(70.0, 90.0),
            memory: Thresholds::new(80.0, 95.0),
        }
    }
}

/// 100 at or above critical, 50 at or above warning, else 0.
pub fn step_score(value: f64, thresholds: Thresholds) -> u32 {
    if value >= thresholds.critical {
        100
    } else if value >= thresholds.warning {
        50
    } else {
        0
    }
}

/// Per-signal step scores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub io_wait: u32,
    pub cpu_load: u32,
    pub db_pool: u32,
    pub memory: u32,
}

impl ComponentScores {
    pub fn from_readings(readings: &Readings, thresholds: &HealthThresholds) -> Self {
        Self {
            io_wait: step_score(readings.io_wait_percent, thresholds.io_wait),
            cpu_load: step_score(readings.cpu_load_percent, thresholds.cpu_load),
            db_pool: step_score(readings.db_pool_percent, thresholds.db_pool),
            memory: step_score(readings.memory_percent, thresholds.memory),
        }
    }

    pub fn composite(&self) -> u32 {
        composite_score(self)
    }
}

/// `100 − floor(0.4·io + 0.3·cpu + 0.2·db + 0.1·mem)`, never below 0.
pub fn composite_score(scores: &ComponentScores) -> u32 {
    let penalty_tenths = IO_WEIGHT * scores.io_wait
        + CPU_WEIGHT * scores.cpu_load
        + DB_WEIGHT * scores.db_pool
        + MEM_WEIGHT * scores.memory;
    100u32.saturating_sub(penalty_tenths / 10)
}

/// I/O wait share of CPU time between two cumulative samples.
///
/// The first sample has nothing to diff against and reports 0.
pub fn io_wait_percent(previous: Option<CpuTimes>, current: CpuTimes) -> f64 {
    let Some(previous) = previous else {
        return 0.0;
    };
    let total = current.total.saturating_sub(previous.total);
    if total == 0 {
        return 0.0;
    }
    let iowait = current.iowait.saturating_sub(previous.iowait);
    iowait as f64 / total as f64 * 100.0
}

/// Load average as a percentage of available cores.
pub fn cpu_load_percent(load_1m: f64, cores: usize) -> f64 {
    load_1m / cores.max(1) as f64 * 100.0
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Raw signal values from one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Readings {
    pub load_average: LoadAverage,
    /// 1-minute load normalized to core count.
    pub cpu_load_percent: f64,
    pub io_wait_percent: f64,
    pub memory_percent: f64,
    pub db_pool_percent: f64,
}

/// Point-in-time health. Readers always get their own copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub score: u32,
    pub zone: Zone,
    pub readings: Readings,
    pub components: ComponentScores,
    /// When the last successful collection finished. None before the first one.
    pub collected_at: Option<DateTime<Utc>>,
    /// Computed on every read; never stored.
    pub stale: bool,
}

impl HealthMetrics {
    /// The snapshot reported before anything was collected.
    pub fn uncollected() -> Self {
        Self {
            score: 100,
            zone: Zone::Safe,
            readings: Readings::default(),
            components: ComponentScores::default(),
            collected_at: None,
            stale: true,
        }
    }

    /// Score and zone a set of readings.
    pub fn evaluate(readings: Readings, thresholds: &HealthThresholds) -> Self {
        let components = ComponentScores::from_readings(&readings, thresholds);
        let score = components.composite();
        Self {
            score,
            zone: Zone::from_score(score),
            readings,
            components,
            collected_at: Some(Utc::now()),
            stale: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Settings for the health monitor.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    /// A snapshot older than this reads as stale.
    pub stale_after: Duration,
    /// Upper bound for one whole collection cycle.
    pub collection_timeout: Duration,
    pub thresholds: HealthThresholds,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(30),
            collection_timeout: Duration::from_secs(5),
            thresholds: HealthThresholds::default(),
        }
    }
}

/// Anything that can report system health to a scaler.
#[async_trait]
pub trait HealthSource: Send + Sync {
    /// Begin collecting. Idempotent.
    async fn start(&self);

    /// Stop collecting, waiting up to `timeout`. Returns whether the
    /// collector acknowledged in time. Idempotent.
    async fn stop(&self, timeout: Duration) -> bool;

    /// Copy of the latest snapshot with staleness evaluated now.
    fn health(&self) -> HealthMetrics;
}

/// A health source with a fixed, settable snapshot.
///
/// Stands in for the monitor in tests and when host telemetry is disabled.
pub struct StaticHealth {
    metrics: Mutex<HealthMetrics>,
}

impl StaticHealth {
    pub fn new(metrics: HealthMetrics) -> Self {
        Self {
            metrics: Mutex::new(metrics),
        }
    }

    /// A fresh snapshot at the middle of `zone`'s score band.
    pub fn in_zone(zone: Zone) -> Self {
        Self::new(Self::zone_metrics(zone))
    }

    pub fn set(&self, metrics: HealthMetrics) {
        *self.metrics.lock().unwrap_or_else(PoisonError::into_inner) = metrics;
    }

    pub fn set_zone(&self, zone: Zone) {
        self.set(Self::zone_metrics(zone));
    }

    pub fn set_stale(&self, stale: bool) {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stale = stale;
    }

    fn zone_metrics(zone: Zone) -> HealthMetrics {
        let score = match zone {
            Zone::Safe => 100,
            Zone::Warning => 50,
            Zone::Critical => 0,
        };
        HealthMetrics {
            score,
            zone,
            readings: Readings::default(),
            components: ComponentScores::default(),
            collected_at: Some(Utc::now()),
            stale: false,
        }
    }
}

#[async_trait]
impl HealthSource for StaticHealth {
    async fn start(&self) {}

    async fn stop(&self, _timeout: Duration) -> bool {
        true
    }

    fn health(&self) -> HealthMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_score_has_three_levels() {
        let t = Thresholds::new(30.0, 40.0);
        assert_eq!(step_score(0.0, t), 0);
        assert_eq!(step_score(29.9, t), 0);
        assert_eq!(step_score(30.0, t), 50);
        assert_eq!(step_score(39.9, t), 50);
        assert_eq!(step_score(40.0, t), 100);
        assert_eq!(step_score(250.0, t), 100);
    }

    #[test]
    fn zone_boundaries() {
        assert_eq!(Zone::from_score(0), Zone::Critical);
        assert_eq!(Zone::from_score(33), Zone::Critical);
        assert_eq!(Zone::from_score(34), Zone::Warning);
        assert_eq!(Zone::from_score(66), Zone::Warning);
        assert_eq!(Zone::from_score(67), Zone::Safe);
        assert_eq!(Zone::from_score(100), Zone::Safe);
    }

    #[test]
    fn composite_applies_weights() {
        let all = |n| ComponentScores {
            io_wait: n,
            cpu_load: n,
            db_pool: n,
            memory: n,
        };
        assert_eq!(all(0).composite(), 100);
        assert_eq!(all(50).composite(), 50);
        assert_eq!(all(100).composite(), 0);

        let io_only = ComponentScores {
            io_wait: 100,
            ..Default::default()
        };
        assert_eq!(io_only.composite(), 60);
        assert_eq!(composite_score(&io_only), 60);

        let mixed = ComponentScores {
            io_wait: 100,
            cpu_load: 50,
            db_pool: 0,
            memory: 50,
        };
        // 40 + 15 + 0 + 5
        assert_eq!(mixed.composite(), 40);
        assert_eq!(Zone::from_score(mixed.composite()), Zone::Warning);

        let io_and_cpu = ComponentScores {
            io_wait: 100,
            cpu_load: 100,
            ..Default::default()
        };
        // 100 - (40 + 30)
        assert_eq!(io_and_cpu.composite(), 30);
        assert_eq!(Zone::from_score(io_and_cpu.composite()), Zone::Critical);
    }

    #[test]
    fn worked_example_io_saturated_cpu_idle() {
        // 45% iowait against warn=30/crit=40, load 1.0 on 4 cores, db and memory unavailable.
        let thresholds = HealthThresholds {
            io_wait: Thresholds::new(30.0, 40.0),
            ..Default::default()
        };
        let readings = Readings {
            io_wait_percent: 45.0,
            cpu_load_percent: cpu_load_percent(1.0, 4),
            ..Default::default()
        };
        let metrics = HealthMetrics::evaluate(readings, &thresholds);
        assert_eq!(readings.cpu_load_percent, 25.0);
        assert_eq!(metrics.components.io_wait, 100);
        assert_eq!(metrics.components.cpu_load, 0);
        assert_eq!(metrics.score, 60);
        assert_eq!(metrics.zone, Zone::Warning);
    }

    #[test]
    fn io_wait_uses_deltas() {
        let first = CpuTimes {
            iowait: 100,
            total: 1000,
        };
        assert_eq!(io_wait_percent(None, first), 0.0);

        let second = CpuTimes {
            iowait: 145,
            total: 1100,
        };
        assert_eq!(io_wait_percent(Some(first), second), 45.0);

        // Counter reset or no progress.
        assert_eq!(io_wait_percent(Some(second), first), 0.0);
        assert_eq!(io_wait_percent(Some(second), second), 0.0);
    }

    #[test]
    fn cpu_load_tolerates_zero_cores() {
        assert_eq!(cpu_load_percent(2.0, 0), 200.0);
        assert_eq!(cpu_load_percent(2.0, 8), 25.0);
    }

    #[test]
    fn static_health_reports_what_was_set() {
        let source = StaticHealth::in_zone(Zone::Safe);
        assert_eq!(source.health().zone, Zone::Safe);
        source.set_zone(Zone::Critical);
        assert_eq!(source.health().zone, Zone::Critical);
        source.set_stale(true);
        assert!(source.health().stale);
    }
}
