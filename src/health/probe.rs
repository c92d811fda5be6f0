//! Host and database-pool signal sources.
//!
//! The monitor only talks to these traits, so tests can substitute fakes
//! and non-Linux hosts can plug in their own probe.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use sysinfo::System;

/// Load averages over 1, 5 and 15 minutes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// Cumulative CPU time counters, summed over all CPUs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub iowait: u64,
    pub total: u64,
}

/// Connection pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub in_use: u32,
    pub max_open: u32,
}

impl PoolStats {
    /// In-use connections as a percentage of the maximum; 0 when unbounded.
    pub fn utilization_percent(&self) -> f64 {
        if self.max_open == 0 {
            return 0.0;
        }
        f64::from(self.in_use) / f64::from(self.max_open) * 100.0
    }
}

/// OS metrics provider.
#[async_trait]
pub trait SystemProbe: Send + Sync {
    async fn load_average(&self) -> Result<LoadAverage>;

    async fn cpu_times(&self) -> Result<CpuTimes>;

    async fn memory_used_percent(&self) -> Result<f64>;

    /// Logical cores used to normalize load.
    fn cpu_count(&self) -> usize;
}

/// Database pool statistics accessor. `None` means unavailable.
pub trait PoolStatsSource: Send + Sync {
    fn pool_stats(&self) -> Option<PoolStats>;
}

// ---------------------------------------------------------------------------
// sysinfo + /proc
// ---------------------------------------------------------------------------

const PROC_STAT: &str = "/proc/stat";

/// Probe backed by sysinfo (load, memory) and `/proc/stat` (CPU counters).
pub struct SysinfoProbe {
    system: Arc<Mutex<System>>,
    cores: usize,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            cores: num_cpus::get(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemProbe for SysinfoProbe {
    async fn load_average(&self) -> Result<LoadAverage> {
        let load = System::load_average();
        Ok(LoadAverage {
            one: load.one,
            five: load.five,
            fifteen: load.fifteen,
        })
    }

    async fn cpu_times(&self) -> Result<CpuTimes> {
        let stat = tokio::fs::read_to_string(PROC_STAT)
            .await
            .map_err(|e| Error::collection("cpu_times", format!("{PROC_STAT}: {e}")))?;
        parse_proc_stat(&stat)
    }

    async fn memory_used_percent(&self) -> Result<f64> {
        let system = Arc::clone(&self.system);
        tokio::task::spawn_blocking(move || {
            let mut system = system.lock().unwrap_or_else(PoisonError::into_inner);
            system.refresh_memory();
            let total = system.total_memory();
            if total == 0 {
                return Err(Error::collection("memory", "total memory reported as 0"));
            }
            let available = system.available_memory();
            let used = if available == 0 {
                system.used_memory().min(total)
            } else {
                total.saturating_sub(available)
            };
            Ok(used as f64 / total as f64 * 100.0)
        })
        .await
        .map_err(|e| Error::collection("memory", e))?
    }

    fn cpu_count(&self) -> usize {
        self.cores
    }
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
///
/// Columns: user nice system idle iowait irq softirq steal [guest guest_nice].
/// Guest time is already included in user/nice, so only the first eight count.
pub fn parse_proc_stat(stat: &str) -> Result<CpuTimes> {
    let line = stat
        .lines()
        .find(|line| line.starts_with("cpu "))
        .ok_or_else(|| Error::collection("cpu_times", "no aggregate cpu line"))?;

    let fields = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|field| {
            field
                .parse::<u64>()
                .map_err(|e| Error::collection("cpu_times", format!("bad field {field:?}: {e}")))
        })
        .collect::<Result<Vec<u64>>>()?;

    if fields.len() < 5 {
        return Err(Error::collection(
            "cpu_times",
            format!("expected at least 5 columns, got {}", fields.len()),
        ));
    }

    Ok(CpuTimes {
        iowait: fields[4],
        total: fields.iter().sum(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aggregate_cpu_line() {
        let stat = "cpu  100 5 50 800 40 2 3 0 7 0\n\
                    cpu0 50 2 25 400 20 1 1 0 0 0\n\
                    intr 12345\n";
        let times = parse_proc_stat(stat).unwrap();
        assert_eq!(times.iowait, 40);
        assert_eq!(times.total, 1000);
    }

    #[test]
    fn accepts_old_kernels_with_fewer_columns() {
        let times = parse_proc_stat("cpu 10 0 10 70 10\n").unwrap();
        assert_eq!(times.total, 100);
        assert_eq!(times.iowait, 10);
    }

    #[test]
    fn rejects_malformed_stat() {
        assert!(parse_proc_stat("intr 1 2 3\n").is_err());
        assert!(parse_proc_stat("cpu 1 2 x 4 5\n").is_err());
        assert!(parse_proc_stat("cpu 1 2 3\n").is_err());
    }

    #[test]
    fn pool_utilization() {
        let stats = PoolStats {
            in_use: 9,
            max_open: 10,
        };
        assert_eq!(stats.utilization_percent(), 90.0);
        assert_eq!(PoolStats::default().utilization_percent(), 0.0);
    }
}
