//! Health monitor collection, degradation, and staleness, driven by a
//! scripted host on a paused clock.

use async_trait::async_trait;
use jobgate::health::{
    CpuTimes, HealthConfig, HealthMonitor, HealthSource, HealthThresholds, LoadAverage, PoolStats,
    PoolStatsSource, SystemProbe, Thresholds, Zone,
};
use jobgate::scaler::{ConcurrencyScaler, ScalerConfig};
use jobgate::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, advance, sleep};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Ok,
    Fail,
    Hang,
    Panic,
}

#[derive(Debug, Clone, Copy)]
struct Script {
    load: f64,
    cpu: CpuTimes,
    memory: f64,
    load_mode: Mode,
    cpu_mode: Mode,
    memory_mode: Mode,
}

struct ScriptedHost {
    script: Mutex<Script>,
    cores: usize,
    cycles: AtomicU32,
}

impl ScriptedHost {
    fn new(cores: usize) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Script {
                load: 0.0,
                cpu: CpuTimes::default(),
                memory: 0.0,
                load_mode: Mode::Ok,
                cpu_mode: Mode::Ok,
                memory_mode: Mode::Ok,
            }),
            cores,
            cycles: AtomicU32::new(0),
        })
    }

    fn edit(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.script.lock().unwrap());
    }

    fn all_modes(&self, mode: Mode) {
        self.edit(|s| {
            s.load_mode = mode;
            s.cpu_mode = mode;
            s.memory_mode = mode;
        });
    }

    fn script(&self) -> Script {
        *self.script.lock().unwrap()
    }

    fn cycles(&self) -> u32 {
        self.cycles.load(Ordering::SeqCst)
    }
}

async fn play<T>(mode: Mode, signal: &'static str, value: T) -> Result<T> {
    match mode {
        Mode::Ok => Ok(value),
        Mode::Fail => Err(Error::Collection {
            signal,
            message: "host offline".into(),
        }),
        Mode::Hang => std::future::pending().await,
        Mode::Panic => panic!("{signal} reader crashed"),
    }
}

#[async_trait]
impl SystemProbe for ScriptedHost {
    async fn load_average(&self) -> Result<LoadAverage> {
        let s = self.script();
        let load = LoadAverage {
            one: s.load,
            five: s.load,
            fifteen: s.load,
        };
        play(s.load_mode, "load_average", load).await
    }

    async fn cpu_times(&self) -> Result<CpuTimes> {
        self.cycles.fetch_add(1, Ordering::SeqCst);
        let s = self.script();
        play(s.cpu_mode, "cpu_times", s.cpu).await
    }

    async fn memory_used_percent(&self) -> Result<f64> {
        let s = self.script();
        play(s.memory_mode, "memory", s.memory).await
    }

    fn cpu_count(&self) -> usize {
        self.cores
    }
}

struct FakePool(Option<PoolStats>);

impl PoolStatsSource for FakePool {
    fn pool_stats(&self) -> Option<PoolStats> {
        self.0
    }
}

fn config() -> HealthConfig {
    HealthConfig {
        interval: Duration::from_secs(10),
        stale_after: Duration::from_secs(30),
        collection_timeout: Duration::from_secs(5),
        thresholds: HealthThresholds::default(),
    }
}

#[tokio::test(start_paused = true)]
async fn io_saturated_cpu_idle_lands_in_warning() {
    let host = ScriptedHost::new(4);
    host.edit(|s| s.load = 1.0);
    let monitor = HealthMonitor::new(
        HealthConfig {
            thresholds: HealthThresholds {
                io_wait: Thresholds::new(30.0, 40.0),
                ..Default::default()
            },
            ..config()
        },
        host.clone(),
    );

    // First sample has no delta to compare against.
    let first = monitor.collect_once().await;
    assert_eq!(first.readings.io_wait_percent, 0.0);
    assert_eq!(first.readings.cpu_load_percent, 25.0);
    assert_eq!(first.score, 100);
    assert_eq!(first.zone, Zone::Safe);
    assert!(!first.stale);

    host.edit(|s| {
        s.cpu = CpuTimes {
            iowait: 45,
            total: 100,
        }
    });
    let second = monitor.collect_once().await;
    assert_eq!(second.readings.io_wait_percent, 45.0);
    assert_eq!(second.components.io_wait, 100);
    assert_eq!(second.components.cpu_load, 0);
    assert_eq!(second.components.db_pool, 0);
    assert_eq!(second.score, 60);
    assert_eq!(second.zone, Zone::Warning);
    assert_eq!(monitor.health(), second);
}

#[tokio::test(start_paused = true)]
async fn pool_utilization_feeds_the_db_signal() {
    let host = ScriptedHost::new(4);
    let monitor = HealthMonitor::new(config(), host.clone()).with_pool(Arc::new(FakePool(Some(
        PoolStats {
            in_use: 9,
            max_open: 10,
        },
    ))));

    let health = monitor.collect_once().await;
    assert_eq!(health.readings.db_pool_percent, 90.0);
    assert_eq!(health.components.db_pool, 100);
    assert_eq!(health.score, 80);

    let without = HealthMonitor::new(config(), host).with_pool(Arc::new(FakePool(None)));
    let health = without.collect_once().await;
    assert_eq!(health.readings.db_pool_percent, 0.0);
    assert_eq!(health.score, 100);
}

#[tokio::test(start_paused = true)]
async fn failed_signal_keeps_its_last_value() {
    let host = ScriptedHost::new(4);
    host.edit(|s| s.memory = 85.0);
    let monitor = HealthMonitor::new(config(), host.clone());

    let health = monitor.collect_once().await;
    assert_eq!(health.components.memory, 50);
    assert_eq!(health.score, 95);
    assert_eq!(monitor.consecutive_failures(), 0);

    host.edit(|s| {
        s.memory = 10.0;
        s.memory_mode = Mode::Fail;
    });
    for expected in 1..=3 {
        let health = monitor.collect_once().await;
        assert_eq!(health.readings.memory_percent, 85.0);
        assert!(!health.stale, "other signals still refresh the snapshot");
        assert_eq!(monitor.consecutive_failures(), expected);
    }

    host.edit(|s| s.memory_mode = Mode::Ok);
    let health = monitor.collect_once().await;
    assert_eq!(health.readings.memory_percent, 10.0);
    assert_eq!(monitor.consecutive_failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn hanging_signal_is_cut_off_at_the_collection_timeout() {
    let host = ScriptedHost::new(4);
    host.edit(|s| s.load = 2.0);
    let monitor = HealthMonitor::new(config(), host.clone());
    monitor.collect_once().await;

    host.edit(|s| {
        s.load = 3.9;
        s.load_mode = Mode::Hang;
    });
    let started = Instant::now();
    let health = monitor.collect_once().await;

    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(health.readings.load_average.one, 2.0);
    assert_eq!(health.readings.cpu_load_percent, 50.0);
    assert_eq!(monitor.consecutive_failures(), 1);
}

#[tokio::test(start_paused = true)]
async fn staleness_is_evaluated_at_read_time() {
    let host = ScriptedHost::new(4);
    let monitor = HealthMonitor::new(config(), host);

    let before = monitor.health();
    assert!(before.stale);
    assert!(before.collected_at.is_none());
    assert_eq!(before.score, 100);
    assert_eq!(before.zone, Zone::Safe);

    monitor.collect_once().await;
    assert!(!monitor.health().stale);

    advance(Duration::from_secs(29)).await;
    assert!(!monitor.health().stale);

    advance(Duration::from_secs(2)).await;
    assert!(monitor.health().stale);
    assert!(monitor.health().stale, "reads do not reset staleness");

    monitor.collect_once().await;
    assert!(!monitor.health().stale);
}

#[tokio::test(start_paused = true)]
async fn total_collection_failure_ages_into_staleness() {
    let host = ScriptedHost::new(4);
    let monitor = HealthMonitor::new(config(), host.clone());
    let good = monitor.collect_once().await;

    host.all_modes(Mode::Fail);
    advance(Duration::from_secs(20)).await;
    let failed = monitor.collect_once().await;
    assert_eq!(failed.collected_at, good.collected_at);
    assert!(!failed.stale);

    advance(Duration::from_secs(11)).await;
    monitor.collect_once().await;
    assert!(monitor.health().stale);
    assert_eq!(monitor.consecutive_failures(), 2);
}

#[tokio::test(start_paused = true)]
async fn start_collects_immediately_then_on_interval() {
    let host = ScriptedHost::new(4);
    let monitor = HealthMonitor::new(config(), host.clone());

    monitor.start().await;
    assert!(monitor.is_running());
    assert_eq!(host.cycles(), 1);
    assert!(!monitor.health().stale);

    sleep(Duration::from_secs(10) + Duration::from_millis(1)).await;
    assert_eq!(host.cycles(), 2);

    monitor.start().await;
    assert_eq!(host.cycles(), 2, "second start is a no-op");

    sleep(Duration::from_secs(20)).await;
    assert_eq!(host.cycles(), 4);
    assert!(!monitor.health().stale);

    assert!(monitor.stop(Duration::from_secs(1)).await);
    assert!(!monitor.is_running());
    sleep(Duration::from_secs(60)).await;
    assert_eq!(host.cycles(), 4);
    assert!(monitor.health().stale, "nothing refreshes a stopped monitor");

    assert!(monitor.stop(Duration::from_secs(1)).await);
}

#[tokio::test(start_paused = true)]
async fn scaler_drops_to_floor_on_critical_host() {
    let host = ScriptedHost::new(4);
    host.edit(|s| s.load = 4.0);
    let monitor = Arc::new(HealthMonitor::new(config(), host.clone()));
    monitor.collect_once().await;

    host.edit(|s| {
        s.cpu = CpuTimes {
            iowait: 50,
            total: 100,
        }
    });
    let health = monitor.collect_once().await;
    // io 100·0.4 + cpu 100·0.3
    assert_eq!(health.score, 30);
    assert_eq!(health.zone, Zone::Critical);

    let scaler = ConcurrencyScaler::new("embedding", monitor.clone(), ScalerConfig::new(true, 2, 20));
    assert_eq!(scaler.get_concurrency(5), 2);
}

#[tokio::test(start_paused = true)]
async fn panicking_signal_reader_costs_one_cycle_not_the_loop() {
    let host = ScriptedHost::new(4);
    let monitor = HealthMonitor::new(config(), host.clone());
    monitor.start().await;
    assert_eq!(host.cycles(), 1);

    host.edit(|s| s.cpu_mode = Mode::Panic);
    sleep(Duration::from_secs(10) + Duration::from_millis(1)).await;
    assert_eq!(host.cycles(), 2);
    assert!(monitor.is_running());
    assert_eq!(monitor.consecutive_failures(), 1);

    host.edit(|s| s.cpu_mode = Mode::Ok);
    sleep(Duration::from_secs(10)).await;
    assert_eq!(host.cycles(), 3, "collection resumes after the panic");
    assert_eq!(monitor.consecutive_failures(), 0);
    assert!(!monitor.health().stale);

    assert!(monitor.stop(Duration::from_secs(1)).await);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_monitor_ends_collection() {
    let host = ScriptedHost::new(4);
    let monitor = HealthMonitor::new(config(), host.clone());
    monitor.start().await;
    sleep(Duration::from_secs(10) + Duration::from_millis(1)).await;
    assert_eq!(host.cycles(), 2);

    drop(monitor);
    sleep(Duration::from_secs(60)).await;
    assert_eq!(host.cycles(), 2);
}
