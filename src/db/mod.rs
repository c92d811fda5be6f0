//! Database connection pool, migrations, and health check.
//!
//! One Postgres pool is shared by every queue and doubles as the source of
//! the connection-pool pressure signal read by the health monitor.

use crate::error::{Error, Result};
use crate::health::{PoolStats, PoolStatsSource};
use crate::queue::{JobQueue, QueueConfig};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Default pool size when the caller does not choose one.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Database handle. Owns the connection pool shared across all queues.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await
            .map_err(Error::db("connect"))?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(Error::db("health_check"))?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Build a queue over `config.table` that shares this pool.
    pub fn job_queue(&self, config: QueueConfig) -> Result<JobQueue> {
        JobQueue::new(self.pool.clone(), config)
    }

    /// Current pool usage.
    pub fn pool_stats(&self) -> PoolStats {
        pool_stats(&self.pool)
    }
}

fn pool_stats(pool: &PgPool) -> PoolStats {
    let size = pool.size();
    let idle = u32::try_from(pool.num_idle()).unwrap_or(u32::MAX);
    PoolStats {
        in_use: size.saturating_sub(idle),
        max_open: pool.options().get_max_connections(),
    }
}

impl PoolStatsSource for PgPool {
    fn pool_stats(&self) -> Option<PoolStats> {
        Some(pool_stats(self))
    }
}

impl PoolStatsSource for Db {
    fn pool_stats(&self) -> Option<PoolStats> {
        Some(pool_stats(&self.pool))
    }
}
