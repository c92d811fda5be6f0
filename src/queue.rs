//! Generic Postgres job queue: claim, retire, retry, and stale recovery
//! over any table that carries the standard queue columns.
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so any number of processes can
//! dequeue from the same table concurrently without coordinating: rows
//! locked by another transaction are skipped, never waited on.
//!
//! Table and column names are interpolated into SQL text. They come from
//! trusted configuration and are validated as plain identifiers when the
//! queue is built; they must never come from request input.

use crate::error::{Error, Result};
use crate::harness::StaleRecovery;
use crate::model::{JobId, JobRecord, JobStatus, QueueStats};
use crate::telemetry::metrics;
use crate::telemetry::spans::record_job_transition;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use opentelemetry::metrics::Counter;
use serde::Deserialize;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Longest error text stored in the error column, in characters.
pub const MAX_ERROR_CHARS: usize = 1000;

const MAX_IDENTIFIER_LEN: usize = 63;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Per-queue settings. Immutable once the queue is built.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub table: String,
    pub id_column: String,
    pub error_column: String,
    /// `completed_at` for most queues, `processed_at` for outbox tables.
    pub completed_column: String,
    /// 0 = retry forever.
    pub max_attempts: u32,
    pub base_retry_delay_secs: u64,
    pub max_retry_delay_secs: u64,
    pub batch_size: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            table: "jobs".to_string(),
            id_column: "id".to_string(),
            error_column: "last_error".to_string(),
            completed_column: "completed_at".to_string(),
            max_attempts: 3,
            base_retry_delay_secs: 30,
            max_retry_delay_secs: 3600,
            batch_size: 10,
        }
    }
}

impl QueueConfig {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        self
    }

    pub fn error_column(mut self, column: impl Into<String>) -> Self {
        self.error_column = column.into();
        self
    }

    pub fn completed_column(mut self, column: impl Into<String>) -> Self {
        self.completed_column = column.into();
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn retry_delays(mut self, base_secs: u64, max_secs: u64) -> Self {
        self.base_retry_delay_secs = base_secs;
        self.max_retry_delay_secs = max_secs;
        self
    }

    pub fn batch_size(mut self, n: u32) -> Self {
        self.batch_size = n;
        self
    }

    /// Reject anything that is not a plain (optionally schema-qualified) identifier.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.table, true)?;
        validate_identifier(&self.id_column, false)?;
        validate_identifier(&self.error_column, false)?;
        validate_identifier(&self.completed_column, false)?;
        Ok(())
    }
}

fn validate_identifier(name: &str, allow_schema: bool) -> Result<()> {
    let parts: Vec<&str> = name.split('.').collect();
    let max_parts = if allow_schema { 2 } else { 1 };
    if parts.len() > max_parts || !parts.iter().all(|part| is_plain_identifier(part)) {
        return Err(Error::InvalidIdentifier(name.to_string()));
    }
    Ok(())
}

fn is_plain_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    part.len() <= MAX_IDENTIFIER_LEN && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Delay before retry number `attempt`: `min(max, base * attempt²)`.
///
/// Quadratic rather than `2^attempt`; older docs describe exponential
/// backoff but the deployed schedule has always been quadratic.
pub fn retry_delay(base_secs: u64, max_secs: u64, attempt: u32) -> Duration {
    let attempt = u64::from(attempt);
    let secs = base_secs
        .saturating_mul(attempt.saturating_mul(attempt))
        .min(max_secs);
    Duration::from_secs(secs)
}

/// What `mark_failed` did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to `pending`, claimable again after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Attempt budget spent; the row is now terminally `failed`.
    Exhausted { attempts: u32 },
}

fn truncate_error(msg: &str) -> &str {
    match msg.char_indices().nth(MAX_ERROR_CHARS) {
        Some((idx, _)) => &msg[..idx],
        None => msg,
    }
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

/// SQL text for one queue, rendered once from validated identifiers.
#[derive(Debug, Clone)]
struct Statements {
    dequeue: String,
    mark_done: String,
    fail_terminal: String,
    fail_retry: String,
    recover_stale: String,
    stats: String,
    get: String,
}

impl Statements {
    fn render(c: &QueueConfig) -> Self {
        let (t, id, err, done) = (
            &c.table,
            &c.id_column,
            &c.error_column,
            &c.completed_column,
        );
        Self {
            dequeue: format!(
                "WITH due AS (
                     SELECT {id} FROM {t}
                     WHERE status = 'pending' AND scheduled_at <= now()
                     ORDER BY priority DESC, scheduled_at ASC
                     LIMIT $1
                     FOR UPDATE SKIP LOCKED
                 )
                 UPDATE {t} AS q
                 SET status = 'processing', started_at = now(), updated_at = now()
                 FROM due
                 WHERE q.{id} = due.{id}
                 RETURNING q.{id}"
            ),
            mark_done: format!(
                "UPDATE {t} SET status = $2, {done} = now(), updated_at = now()
                 WHERE {id} = $1 AND status = 'processing'"
            ),
            fail_terminal: format!(
                "UPDATE {t} SET status = 'failed', attempt_count = $2, {err} = $3, updated_at = now()
                 WHERE {id} = $1 AND status = 'processing'"
            ),
            fail_retry: format!(
                "UPDATE {t} SET status = 'pending', attempt_count = $2, {err} = $3,
                     started_at = NULL, scheduled_at = now() + make_interval(secs => $4),
                     updated_at = now()
                 WHERE {id} = $1 AND status = 'processing'"
            ),
            recover_stale: format!(
                "UPDATE {t} SET status = 'pending', started_at = NULL, scheduled_at = now(), updated_at = now()
                 WHERE status = 'processing' AND started_at < now() - make_interval(mins => $1)"
            ),
            stats: format!("SELECT status, COUNT(*) FROM {t} GROUP BY status"),
            get: format!(
                "SELECT {id} AS id, status, priority, scheduled_at, started_at, {done} AS completed_at,
                        attempt_count, {err} AS last_error, created_at, updated_at
                 FROM {t} WHERE {id} = $1"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// A job queue over one table.
pub struct JobQueue {
    pool: PgPool,
    config: QueueConfig,
    sql: Statements,
    operations: Counter<u64>,
    transitions: Counter<u64>,
    claimed: Counter<u64>,
}

impl JobQueue {
    /// Build a queue. Fails if any configured identifier is not a plain name.
    pub fn new(pool: PgPool, config: QueueConfig) -> Result<Self> {
        config.validate()?;
        let sql = Statements::render(&config);
        Ok(Self {
            pool,
            config,
            sql,
            operations: metrics::queue_operations(),
            transitions: metrics::queue_transitions(),
            claimed: metrics::queue_claimed(),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Claim up to `batch_size` due pending jobs (0 = configured default).
    ///
    /// Two concurrent callers never receive the same id.
    pub async fn dequeue(&self, batch_size: u32) -> Result<Vec<JobId>> {
        let limit = if batch_size == 0 {
            self.config.batch_size
        } else {
            batch_size
        };

        let rows: Vec<(Uuid,)> = sqlx::query_as(&self.sql.dequeue)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(Error::db("dequeue"))?;

        self.count_operation("dequeue");
        if !rows.is_empty() {
            self.claimed
                .add(rows.len() as u64, &[KeyValue::new("table", self.table_label())]);
            self.count_transition(JobStatus::Pending, JobStatus::Processing, rows.len() as u64);
            debug!(table = %self.config.table, claimed = rows.len(), "dequeued jobs");
        }

        Ok(rows.into_iter().map(|(id,)| JobId(id)).collect())
    }

    /// Processing → completed.
    pub async fn mark_completed(&self, id: JobId) -> Result<()> {
        self.mark_done(id, JobStatus::Completed, "mark_completed")
            .await
    }

    /// Processing → sent (outbox-style queues).
    pub async fn mark_sent(&self, id: JobId) -> Result<()> {
        self.mark_done(id, JobStatus::Sent, "mark_sent").await
    }

    async fn mark_done(&self, id: JobId, to: JobStatus, op: &'static str) -> Result<()> {
        let affected = sqlx::query(&self.sql.mark_done)
            .bind(id.0)
            .bind(to.as_str())
            .execute(&self.pool)
            .await
            .map_err(Error::db(op))?
            .rows_affected();

        self.count_operation(op);
        if affected == 0 {
            return Err(Error::NotClaimed(id.to_string()));
        }
        self.count_transition(JobStatus::Processing, to, 1);
        record_job_transition(&self.config.table, &id.to_string(), "processing", to.as_str());
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// `attempt_count` is the count before this failure. Once the budget is
    /// spent the row goes terminally `failed` and keeps its `scheduled_at`;
    /// otherwise it returns to `pending` after [`retry_delay`].
    pub async fn mark_failed(
        &self,
        id: JobId,
        attempt_count: u32,
        err_msg: &str,
    ) -> Result<FailureDisposition> {
        let attempt = attempt_count.saturating_add(1);
        let err_msg = truncate_error(err_msg);
        let attempt_col = i32::try_from(attempt).unwrap_or(i32::MAX);

        let exhausted = self.config.max_attempts > 0 && attempt >= self.config.max_attempts;

        let (affected, disposition) = if exhausted {
            let affected = sqlx::query(&self.sql.fail_terminal)
                .bind(id.0)
                .bind(attempt_col)
                .bind(err_msg)
                .execute(&self.pool)
                .await
                .map_err(Error::db("mark_failed"))?
                .rows_affected();
            (affected, FailureDisposition::Exhausted { attempts: attempt })
        } else {
            let delay = retry_delay(
                self.config.base_retry_delay_secs,
                self.config.max_retry_delay_secs,
                attempt,
            );
            let affected = sqlx::query(&self.sql.fail_retry)
                .bind(id.0)
                .bind(attempt_col)
                .bind(err_msg)
                .bind(delay.as_secs_f64())
                .execute(&self.pool)
                .await
                .map_err(Error::db("mark_failed"))?
                .rows_affected();
            (affected, FailureDisposition::Retry { attempt, delay })
        };

        self.count_operation("mark_failed");
        if affected == 0 {
            return Err(Error::NotClaimed(id.to_string()));
        }

        match disposition {
            FailureDisposition::Exhausted { attempts } => {
                self.count_transition(JobStatus::Processing, JobStatus::Failed, 1);
                error!(
                    table = %self.config.table,
                    job.id = %id,
                    attempts,
                    error = err_msg,
                    "job failed permanently"
                );
            }
            FailureDisposition::Retry { attempt, delay } => {
                self.count_transition(JobStatus::Processing, JobStatus::Pending, 1);
                warn!(
                    table = %self.config.table,
                    job.id = %id,
                    attempt,
                    delay_secs = delay.as_secs(),
                    error = err_msg,
                    "job failed, retry scheduled"
                );
            }
        }

        Ok(disposition)
    }

    /// Return jobs stuck in `processing` for longer than `threshold_minutes`
    /// to `pending`. Returns how many rows were reclaimed.
    pub async fn recover_stale_jobs(&self, threshold_minutes: u32) -> Result<u64> {
        let minutes = i32::try_from(threshold_minutes).unwrap_or(i32::MAX);
        let recovered = sqlx::query(&self.sql.recover_stale)
            .bind(minutes)
            .execute(&self.pool)
            .await
            .map_err(Error::db("recover_stale_jobs"))?
            .rows_affected();

        self.count_operation("recover_stale_jobs");
        if recovered > 0 {
            self.count_transition(JobStatus::Processing, JobStatus::Pending, recovered);
            warn!(
                table = %self.config.table,
                recovered,
                threshold_minutes,
                "recovered stale jobs"
            );
        }
        Ok(recovered)
    }

    /// Row counts per status.
    pub async fn get_stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(&self.sql.stats)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::db("get_stats"))?;

        self.count_operation("get_stats");
        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.parse::<JobStatus>() {
                Ok(status) => stats.add(status, u64::try_from(count).unwrap_or(0)),
                Err(_) => {
                    debug!(table = %self.config.table, status, "ignoring unknown status")
                }
            }
        }
        Ok(stats)
    }

    /// Fetch the queue-visible columns of one job.
    pub async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as(&self.sql.get)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::db("get"))?;

        row.map(JobRow::try_into_record).transpose()
    }

    fn table_label(&self) -> String {
        self.config.table.clone()
    }

    fn count_operation(&self, operation: &'static str) {
        self.operations.add(
            1,
            &[
                KeyValue::new("table", self.table_label()),
                KeyValue::new("operation", operation),
            ],
        );
    }

    fn count_transition(&self, from: JobStatus, to: JobStatus, n: u64) {
        debug_assert!(from.can_transition_to(to), "illegal transition {from} -> {to}");
        self.transitions.add(
            n,
            &[
                KeyValue::new("table", self.table_label()),
                KeyValue::new("from", from.as_str()),
                KeyValue::new("to", to.as_str()),
            ],
        );
    }
}

#[async_trait]
impl StaleRecovery for JobQueue {
    async fn recover_stale(&self, threshold_minutes: u32) -> Result<u64> {
        let recovered = self.recover_stale_jobs(threshold_minutes).await?;
        if recovered == 0 {
            info!(table = %self.config.table, "no stale jobs to recover");
        }
        Ok(recovered)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    status: String,
    priority: i32,
    scheduled_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
    attempt_count: i32,
    last_error: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl JobRow {
    fn try_into_record(self) -> Result<JobRecord> {
        Ok(JobRecord {
            id: JobId(self.id),
            status: self.status.parse()?,
            priority: self.priority,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            attempt_count: u32::try_from(self.attempt_count).unwrap_or(0),
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_is_quadratic_until_capped() {
        let delays: Vec<u64> = (1..=8).map(|n| retry_delay(30, 900, n).as_secs()).collect();
        assert_eq!(delays, vec![30, 120, 270, 480, 750, 900, 900, 900]);
    }

    #[test]
    fn retry_delay_never_decreases() {
        let mut prev = Duration::ZERO;
        for attempt in 1..200 {
            let d = retry_delay(7, 3600, attempt);
            assert!(d >= prev, "attempt {attempt}: {d:?} < {prev:?}");
            assert!(d <= Duration::from_secs(3600));
            prev = d;
        }
    }

    #[test]
    fn retry_delay_saturates_instead_of_overflowing() {
        assert_eq!(
            retry_delay(u64::MAX, 60, u32::MAX),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(QueueConfig::new("jobs").validate().is_ok());
        assert!(QueueConfig::new("ingest.document_jobs").validate().is_ok());
        assert!(QueueConfig::new("_private2").validate().is_ok());

        for bad in [
            "",
            "1jobs",
            "jobs; DROP TABLE jobs",
            "a.b.c",
            "jobs\"",
            "job-queue",
            ".jobs",
        ] {
            assert!(
                matches!(
                    QueueConfig::new(bad).validate(),
                    Err(Error::InvalidIdentifier(_))
                ),
                "{bad:?} should be rejected"
            );
        }

        let long = "x".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(QueueConfig::new(long).validate().is_err());
        assert!(
            QueueConfig::new("jobs")
                .error_column("schema.col")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn dequeue_statement_skips_locked_rows_in_priority_order() {
        let sql = Statements::render(&QueueConfig::new("email_jobs").id_column("job_id"));
        assert!(sql.dequeue.contains("FOR UPDATE SKIP LOCKED"));
        assert!(sql.dequeue.contains("ORDER BY priority DESC, scheduled_at ASC"));
        assert!(sql.dequeue.contains("SELECT job_id FROM email_jobs"));
        assert!(sql.dequeue.contains("RETURNING q.job_id"));
    }

    #[test]
    fn statements_use_configured_columns() {
        let config = QueueConfig::new("outbound_emails")
            .error_column("error_message")
            .completed_column("processed_at");
        let sql = Statements::render(&config);
        assert!(sql.mark_done.contains("processed_at = now()"));
        assert!(sql.fail_terminal.contains("error_message = $3"));
        assert!(!sql.fail_terminal.contains("scheduled_at"));
        assert!(sql.fail_retry.contains("scheduled_at = now() + make_interval(secs => $4)"));
        assert!(sql.get.contains("processed_at AS completed_at"));
    }

    #[test]
    fn error_text_is_truncated_on_char_boundary() {
        let short = "connection reset";
        assert_eq!(truncate_error(short), short);

        let long = "é".repeat(MAX_ERROR_CHARS + 10);
        let truncated = truncate_error(&long);
        assert_eq!(truncated.chars().count(), MAX_ERROR_CHARS);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: QueueConfig = toml::from_str(
            r#"
            table = "outbound_emails"
            completed_column = "processed_at"
            max_attempts = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.table, "outbound_emails");
        assert_eq!(config.max_attempts, 0);
        assert_eq!(config.id_column, "id");
        assert_eq!(config.batch_size, 10);
    }
}
