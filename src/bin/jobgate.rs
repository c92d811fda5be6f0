//! jobgate CLI: operator interface to queues, health, and worker scaling.

use clap::{Parser, Subcommand};
use jobgate::config::secrets::ExposeSecret;
use jobgate::config::{Config, QueueSection, RuntimeConfig};
use jobgate::db::Db;
use jobgate::harness::{HarnessConfig, StaleRecovery, WorkerHarness};
use jobgate::health::{HealthMonitor, HealthSource, SysinfoProbe};
use jobgate::queue::{JobQueue, QueueConfig};
use jobgate::scaler::ConcurrencyScaler;
use jobgate::telemetry::{TelemetryConfig, init_telemetry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "jobgate", about = "Backpressure-controlled job execution")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the health monitor, stale-job reapers, and scaler reports
    Serve {
        /// Run migrations before starting
        #[arg(long)]
        migrate: bool,
        /// Seconds to wait for background tasks on shutdown
        #[arg(long, default_value_t = 10)]
        shutdown_timeout: u64,
    },
    /// Sample host health once and print the snapshot
    Health {
        /// Seconds between the two samples used for the I/O wait delta
        #[arg(long, default_value_t = 1)]
        sample_secs: u64,
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Queue operations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Show job counts per status
    Stats {
        /// Queue table name
        table: String,
        /// Print counts as JSON
        #[arg(long)]
        json: bool,
    },
    /// Return jobs stuck in processing to pending
    Recover {
        /// Queue table name
        table: String,
        /// Age in minutes after which a processing job counts as orphaned
        #[arg(long)]
        threshold_minutes: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            migrate,
            shutdown_timeout,
        } => cmd_serve(migrate, Duration::from_secs(shutdown_timeout)).await,
        Command::Health { sample_secs, json } => {
            cmd_health(Duration::from_secs(sample_secs), json).await
        }
        Command::Queue { action } => {
            let config = Config::from_env()?;
            let runtime = config.load_runtime()?;
            let db = Db::connect(
                config.database_url.expose_secret(),
                runtime.database.max_connections,
            )
            .await?;

            match action {
                QueueAction::Stats { table, json } => {
                    cmd_queue_stats(&db, &runtime, &table, json).await
                }
                QueueAction::Recover {
                    table,
                    threshold_minutes,
                } => cmd_queue_recover(&db, &runtime, &table, threshold_minutes).await,
            }
        }
    }
}

async fn cmd_serve(migrate: bool, shutdown_timeout: Duration) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let runtime = config.load_runtime()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "jobgate".to_string(),
        default_level: config.log_level.clone(),
    })?;

    let db = Db::connect(
        config.database_url.expose_secret(),
        runtime.database.max_connections,
    )
    .await?;
    if migrate {
        db.migrate().await?;
    }

    let health_config = runtime.health.to_health_config();
    let report_interval = health_config.interval;
    let monitor = Arc::new(
        HealthMonitor::new(health_config, Arc::new(SysinfoProbe::new()))
            .with_pool(Arc::new(db.clone())),
    );
    monitor.start().await;

    let mut harnesses = Vec::new();
    for section in &runtime.queues {
        let harness = reaper(&db, section)?;
        harness.start();
        harnesses.push(harness);
    }

    for (worker_type, scaler_config) in &runtime.scalers {
        let health: Arc<dyn HealthSource> = monitor.clone();
        let scaler = Arc::new(ConcurrencyScaler::new(
            worker_type.clone(),
            health,
            *scaler_config,
        ));
        let harness = WorkerHarness::new(
            HarnessConfig::new(format!("scaler-{worker_type}")).poll_interval(report_interval),
            move |_ctx| {
                let scaler = Arc::clone(&scaler);
                async move {
                    let ceiling = scaler.config().max;
                    let allowed = scaler.get_concurrency(ceiling);
                    info!(worker_type = scaler.worker_type(), allowed, ceiling, "concurrency");
                    Ok(())
                }
            },
        );
        harness.start();
        harnesses.push(harness);
    }

    info!(
        queues = runtime.queues.len(),
        scalers = runtime.scalers.len(),
        "jobgate serving"
    );
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    for harness in &harnesses {
        if !harness.stop(shutdown_timeout).await {
            warn!(worker = harness.name(), "worker still running at shutdown");
        }
    }
    monitor.stop(shutdown_timeout).await;
    Ok(())
}

/// A harness that periodically returns orphaned jobs in one table to pending.
fn reaper(db: &Db, section: &QueueSection) -> anyhow::Result<WorkerHarness> {
    let queue = Arc::new(db.job_queue(section.queue.clone())?);
    let threshold = section.stale_threshold_minutes;
    let config = HarnessConfig::new(format!("reaper-{}", section.queue.table))
        .poll_interval(Duration::from_secs(section.reaper_interval_secs))
        .stale_threshold_minutes(threshold)
        .recover_stale_on_start(true);

    let recovery: Arc<dyn StaleRecovery> = queue.clone();
    let harness = WorkerHarness::new(config, move |ctx| {
        let queue = Arc::clone(&queue);
        async move {
            let recovered = queue.recover_stale_jobs(threshold).await?;
            ctx.counters.add_processed(recovered);
            ctx.counters.add_succeeded(recovered);
            Ok::<_, jobgate::Error>(())
        }
    })
    .with_recovery(recovery);
    Ok(harness)
}

async fn cmd_health(sample: Duration, json: bool) -> anyhow::Result<()> {
    let monitor = HealthMonitor::new(Default::default(), Arc::new(SysinfoProbe::new()));
    monitor.collect_once().await;
    tokio::time::sleep(sample).await;
    let health = monitor.collect_once().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&health)?);
        return Ok(());
    }

    let r = &health.readings;
    let c = &health.components;
    println!("Score:      {} ({})", health.score, health.zone);
    println!(
        "Load:       {:.2} {:.2} {:.2}  ({:.1}% of cores, score {})",
        r.load_average.one, r.load_average.five, r.load_average.fifteen, r.cpu_load_percent, c.cpu_load
    );
    println!("I/O wait:   {:.1}%  (score {})", r.io_wait_percent, c.io_wait);
    println!("Memory:     {:.1}%  (score {})", r.memory_percent, c.memory);
    println!("DB pool:    {:.1}%  (score {})", r.db_pool_percent, c.db_pool);
    if monitor.consecutive_failures() > 0 {
        println!("(some signals failed to collect; see logs)");
    }
    Ok(())
}

fn queue_for(db: &Db, runtime: &RuntimeConfig, table: &str) -> anyhow::Result<JobQueue> {
    let config = runtime
        .queue(table)
        .map(|section| section.queue.clone())
        .unwrap_or_else(|| QueueConfig::new(table));
    Ok(db.job_queue(config)?)
}

async fn cmd_queue_stats(
    db: &Db,
    runtime: &RuntimeConfig,
    table: &str,
    json: bool,
) -> anyhow::Result<()> {
    let queue = queue_for(db, runtime, table)?;
    let stats = queue.get_stats().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("{:<12}  COUNT", "STATUS");
    println!("{}", "-".repeat(24));
    println!("{:<12}  {}", "pending", stats.pending);
    println!("{:<12}  {}", "processing", stats.processing);
    println!("{:<12}  {}", "completed", stats.completed);
    println!("{:<12}  {}", "failed", stats.failed);
    println!("{:<12}  {}", "sent", stats.sent);
    println!(
        "\n{} job(s) in {table}, {} unfinished",
        stats.total(),
        stats.unfinished()
    );
    Ok(())
}

async fn cmd_queue_recover(
    db: &Db,
    runtime: &RuntimeConfig,
    table: &str,
    threshold_minutes: Option<u32>,
) -> anyhow::Result<()> {
    let threshold = threshold_minutes
        .or_else(|| runtime.queue(table).map(|s| s.stale_threshold_minutes))
        .unwrap_or(jobgate::harness::DEFAULT_STALE_THRESHOLD_MINUTES);
    let queue = queue_for(db, runtime, table)?;
    let recovered = queue.recover_stale_jobs(threshold).await?;
    println!("Recovered {recovered} job(s) older than {threshold} minute(s) in {table}");
    Ok(())
}
