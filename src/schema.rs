//! Database row types.
//!
//! All timestamps are unix milliseconds; see [`crate::clock`].

use serde::Serialize;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to be claimed (possibly deferred by `retry_at`/`run_at`).
    Pending,
    /// Claimed by a worker holding a live lease.
    Processing,
    /// Finished with exit code 0. Terminal.
    Completed,
    /// Retry budget exhausted; indexed in the DLQ. Terminal except for a
    /// manual DLQ retry.
    Dead,
}

impl JobState {
    /// The canonical lowercase name stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Dead => "dead",
        }
    }

    /// Every state, in display order.
    pub const ALL: [JobState; 4] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Dead,
    ];
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A job record in the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    /// Caller-chosen unique identifier.
    pub id: String,
    /// Opaque command string handed to the OS shell.
    pub command: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Priority in `0..=10`; `0` is the FIFO class, anything above jumps it.
    pub priority: i64,
    /// Number of executions that finished with a non-zero exit or timeout.
    pub attempts: i64,
    /// Additional attempts allowed after the first failure.
    pub max_retries: i64,
    /// PID of the worker holding the lease, while processing.
    pub locked_by: Option<i64>,
    /// Lease expiry, while processing.
    pub locked_until: Option<i64>,
    /// Earliest time the job becomes claimable again after a failure.
    pub retry_at: Option<i64>,
    /// Earliest time the job becomes claimable for its first run.
    pub run_at: Option<i64>,
    /// Last failure message (exit code and stderr snippet, or timeout note).
    pub last_error: Option<String>,
    /// Exit code of the most recent execution.
    pub exit_code: Option<i64>,
    /// Captured stdout of the most recent execution.
    pub stdout_log: Option<String>,
    /// Captured stderr of the most recent execution.
    pub stderr_log: Option<String>,
    /// Creation timestamp; FIFO tie-break within a priority level.
    pub created_at: i64,
    /// Last mutation timestamp.
    pub updated_at: i64,
    /// Set once the job reaches `completed`.
    pub completed_at: Option<i64>,
}

impl Job {
    /// Whether the job would be claimable at `now`, ignoring lease state.
    pub fn runnable_at(&self, now: i64) -> bool {
        self.state == JobState::Pending
            && self.retry_at.is_none_or(|t| t <= now)
            && self.run_at.is_none_or(|t| t <= now)
    }
}

/// A dead-letter queue entry. The job row itself is retained with
/// `state = dead`; this table is the canonical index of permanent failures.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DlqEntry {
    /// Id of the dead job.
    pub job_id: String,
    /// Why the job was moved (last error, prefixed with the retry verdict).
    pub reason: String,
    /// When the move happened.
    pub moved_at: i64,
    /// JSON snapshot of the job row at the time of death.
    pub payload: String,
}

/// Per-state job counts, as shown by `queuectl status`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct JobCounts {
    /// Jobs waiting to run (including deferred retries).
    pub pending: i64,
    /// Jobs currently leased to a worker.
    pub processing: i64,
    /// Successfully finished jobs.
    pub completed: i64,
    /// Jobs in the dead-letter queue.
    pub dead: i64,
}

impl JobCounts {
    /// Count for a single state.
    pub fn get(&self, state: JobState) -> i64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Dead => self.dead,
        }
    }
}
