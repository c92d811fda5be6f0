//! Core data model.
//!
//! A job is a row in a caller-defined queue table. The queue only knows the
//! columns it needs to claim, retry and retire rows; payload columns belong
//! to the worker type that owns the table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// The queue-visible part of a job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,

    /// Higher = claimed first.
    pub priority: i32,

    /// Not claimable before this instant. Advanced on retry.
    pub scheduled_at: DateTime<Utc>,

    /// Set when claimed, cleared by stale recovery.
    pub started_at: Option<DateTime<Utc>>,

    /// `completed_at` or `processed_at`, depending on the table.
    pub completed_at: Option<DateTime<Utc>>,

    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job row, stored as text in the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `scheduled_at` and a free worker.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Done successfully. Terminal.
    Completed,
    /// Attempt budget exhausted. Terminal.
    Failed,
    /// Delivered (outbox-style queues such as email). Terminal.
    Sent,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Sent,
    ];

    /// Can a row move from self to `to` within one attempt cycle?
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Sent)
                | (Processing, Pending) // retry or stale recovery
                | (Processing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Sent
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Sent => "sent",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| crate::error::Error::Other(format!("unknown job status: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Row counts per status for one queue table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub sent: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.sent
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Sent => self.sent,
        }
    }

    /// Jobs still waiting for or undergoing an attempt.
    pub fn unfinished(&self) -> u64 {
        JobStatus::ALL
            .into_iter()
            .filter(|status| !status.is_terminal())
            .map(|status| self.count(status))
            .sum()
    }

    pub(crate) fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Sent => self.sent += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in JobStatus::ALL {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("dead".parse::<JobStatus>().is_err());
    }

    #[test]
    fn attempt_cycle_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Pending));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Sent));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Processing));
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Sent.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn stats_total_sums_every_status() {
        let mut stats = QueueStats::default();
        stats.add(JobStatus::Pending, 3);
        stats.add(JobStatus::Failed, 2);
        stats.add(JobStatus::Sent, 1);
        assert_eq!(stats.total(), 6);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.count(JobStatus::Failed), 2);
    }

    #[test]
    fn unfinished_counts_only_live_statuses() {
        let mut stats = QueueStats::default();
        stats.add(JobStatus::Pending, 4);
        stats.add(JobStatus::Processing, 2);
        stats.add(JobStatus::Completed, 7);
        stats.add(JobStatus::Failed, 1);
        stats.add(JobStatus::Sent, 3);
        assert_eq!(stats.unfinished(), 6);
        assert_eq!(QueueStats::default().unfinished(), 0);
    }
}
