//! Durable job storage.
//!
//! A single SQLite file holds the `jobs`, `dlq`, and `config` tables and is
//! the only state shared between workers. Every mutation here is a single
//! write statement or an explicit transaction, so commits are atomic and
//! serialized by the database's write lock.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::debug;
use uuid::Uuid;

use crate::errors::{Result, StoreError};
use crate::executor::ExecOutcome;
use crate::schema::{DlqEntry, Job, JobCounts, JobState};

/// Maximum characters of stderr kept in a job's `last_error` column.
const ERROR_SNIPPET_LEN: usize = 512;

/// Input for [`Store::enqueue`].
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Unique id; generated (UUIDv4) when not supplied by the caller.
    pub id: Option<String>,
    /// Shell command to execute.
    pub command: String,
    /// Additional attempts allowed after the first failure.
    pub max_retries: i64,
    /// Priority in `0..=10`.
    pub priority: i64,
    /// Earliest time (unix millis) of the first execution; `None` = now.
    pub run_at: Option<i64>,
}

/// Handle to the queue database.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    path: PathBuf,
}

impl Store {
    /// Opens (creating if missing) the database at `path` and ensures the
    /// schema exists. WAL mode keeps readers off the writers' lock; the busy
    /// timeout makes concurrent claimers wait instead of erroring.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|source| StoreError::Open {
                path: path.clone(),
                source,
            })?;

        let store = Self { pool, path };
        store.init_schema().await?;
        Ok(store)
    }

    /// Path of the underlying database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS jobs (
                id           TEXT PRIMARY KEY,
                command      TEXT NOT NULL,
                state        TEXT NOT NULL DEFAULT 'pending',
                priority     INTEGER NOT NULL DEFAULT 0,
                attempts     INTEGER NOT NULL DEFAULT 0,
                max_retries  INTEGER NOT NULL DEFAULT 3,
                locked_by    INTEGER,
                locked_until INTEGER,
                retry_at     INTEGER,
                run_at       INTEGER,
                last_error   TEXT,
                exit_code    INTEGER,
                stdout_log   TEXT,
                stderr_log   TEXT,
                created_at   INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL,
                completed_at INTEGER,
                CHECK (state IN ('pending', 'processing', 'completed', 'dead')),
                CHECK (priority BETWEEN 0 AND 10)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs (state)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_retry_at ON jobs (retry_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS dlq (
                job_id   TEXT PRIMARY KEY REFERENCES jobs (id),
                reason   TEXT NOT NULL,
                moved_at INTEGER NOT NULL,
                payload  TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS config (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Inserts a new pending job and returns the stored row.
    pub async fn enqueue(&self, new_job: NewJob, now: i64) -> Result<Job> {
        if new_job.command.trim().is_empty() {
            return Err(StoreError::InvalidJob("command must not be empty".into()));
        }
        if !(0..=10).contains(&new_job.priority) {
            return Err(StoreError::InvalidJob(format!(
                "priority must be between 0 and 10, got {}",
                new_job.priority
            )));
        }
        if new_job.max_retries < 0 {
            return Err(StoreError::InvalidJob(format!(
                "max_retries must not be negative, got {}",
                new_job.max_retries
            )));
        }

        let id = new_job.id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let job = sqlx::query_as::<_, Job>(
            r"
            INSERT INTO jobs (id, command, state, priority, attempts, max_retries,
                              run_at, created_at, updated_at)
            VALUES (?1, ?2, 'pending', ?3, 0, ?4, ?5, ?6, ?6)
            RETURNING *
            ",
        )
        .bind(&id)
        .bind(&new_job.command)
        .bind(new_job.priority)
        .bind(new_job.max_retries)
        .bind(new_job.run_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| StoreError::on_insert(&id, err))?;

        debug!(job.id = %job.id, job.priority = job.priority, "Job enqueued");
        Ok(job)
    }

    /// Fetches a job by id.
    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Lists jobs, newest first, optionally filtered by state.
    pub async fn list(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>> {
        let jobs = match state {
            Some(state) => {
                sqlx::query_as::<_, Job>(
                    "SELECT * FROM jobs WHERE state = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                )
                .bind(state)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Job>(
                    "SELECT * FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(jobs)
    }

    /// Per-state job counts.
    pub async fn counts(&self) -> Result<JobCounts> {
        let rows =
            sqlx::query_as::<_, (JobState, i64)>("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = JobCounts::default();
        for (state, count) in rows {
            match state {
                JobState::Pending => counts.pending = count,
                JobState::Processing => counts.processing = count,
                JobState::Completed => counts.completed = count,
                JobState::Dead => counts.dead = count,
            }
        }
        Ok(counts)
    }

    /// Atomically claims the highest-ranked runnable job for `worker_id`,
    /// stamping a lease that expires at `now + lease_ms`.
    ///
    /// The claim is one `UPDATE` whose subquery picks the candidate row, so
    /// the database's write lock is held for the whole select-and-stamp.
    /// Two concurrent claimers serialize on that lock and the loser re-reads
    /// committed state; it can never stamp the row the winner took.
    ///
    /// Ranking: priority class first (`priority > 0` beats `priority = 0`),
    /// then higher `priority`, then FIFO by `created_at` with `rowid` as the
    /// same-millisecond tie-break.
    pub async fn claim_next_runnable(
        &self,
        worker_id: i64,
        now: i64,
        lease_ms: i64,
    ) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r"
            UPDATE jobs SET
                state = 'processing',
                locked_by = ?1,
                locked_until = ?2,
                updated_at = ?3
            WHERE id = (
                SELECT id FROM jobs
                WHERE state = 'pending'
                  AND (run_at IS NULL OR run_at <= ?3)
                  AND (retry_at IS NULL OR retry_at <= ?3)
                  AND (locked_until IS NULL OR locked_until <= ?3)
                ORDER BY
                    CASE WHEN priority > 0 THEN 0 ELSE 1 END,
                    priority DESC,
                    created_at ASC,
                    rowid ASC
                LIMIT 1
            )
            RETURNING *
            ",
        )
        .bind(worker_id)
        .bind(now + lease_ms)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Marks a job completed and records its output. Requires the caller to
    /// still hold the lease.
    pub async fn mark_completed(
        &self,
        id: &str,
        worker_id: i64,
        outcome: &ExecOutcome,
        now: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE jobs SET
                state = 'completed',
                locked_by = NULL,
                locked_until = NULL,
                exit_code = ?1,
                stdout_log = ?2,
                stderr_log = ?3,
                completed_at = ?4,
                updated_at = ?4
            WHERE id = ?5 AND state = 'processing' AND locked_by = ?6
            ",
        )
        .bind(outcome.exit_code)
        .bind(&outcome.stdout)
        .bind(&outcome.stderr)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        self.require_lease_hit(id, result.rows_affected()).await
    }

    /// Returns a failed job to `pending` with its retry scheduled, and
    /// records the failure. Requires the caller to still hold the lease.
    #[allow(clippy::too_many_arguments)]
    pub async fn schedule_retry(
        &self,
        id: &str,
        worker_id: i64,
        new_attempts: i64,
        retry_at: i64,
        error: &str,
        outcome: &ExecOutcome,
        now: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE jobs SET
                state = 'pending',
                locked_by = NULL,
                locked_until = NULL,
                attempts = ?1,
                retry_at = ?2,
                last_error = ?3,
                exit_code = ?4,
                stdout_log = ?5,
                stderr_log = ?6,
                updated_at = ?7
            WHERE id = ?8 AND state = 'processing' AND locked_by = ?9
            ",
        )
        .bind(new_attempts)
        .bind(retry_at)
        .bind(truncate_error(error))
        .bind(outcome.exit_code)
        .bind(&outcome.stdout)
        .bind(&outcome.stderr)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        self.require_lease_hit(id, result.rows_affected()).await
    }

    /// Moves a job whose retry budget is exhausted to the dead-letter queue.
    /// Counts the final failed execution (`attempts + 1`) and snapshots the
    /// job row into the DLQ payload. Requires the caller to hold the lease.
    pub async fn move_to_dlq(
        &self,
        id: &str,
        worker_id: i64,
        reason: &str,
        outcome: &ExecOutcome,
        now: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>(
            r"
            UPDATE jobs SET
                state = 'dead',
                locked_by = NULL,
                locked_until = NULL,
                attempts = attempts + 1,
                last_error = ?1,
                exit_code = ?2,
                stdout_log = ?3,
                stderr_log = ?4,
                updated_at = ?5
            WHERE id = ?6 AND state = 'processing' AND locked_by = ?7
            RETURNING *
            ",
        )
        .bind(truncate_error(reason))
        .bind(outcome.exit_code)
        .bind(&outcome.stdout)
        .bind(&outcome.stderr)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = job else {
            tx.rollback().await?;
            return Err(self.lease_miss(id).await);
        };

        let payload = serde_json::to_string(&job).unwrap_or_else(|_| String::from("{}"));

        sqlx::query("INSERT INTO dlq (job_id, reason, moved_at, payload) VALUES (?1, ?2, ?3, ?4)")
            .bind(id)
            .bind(truncate_error(reason))
            .bind(now)
            .bind(payload)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(job.id = id, "Job moved to DLQ");
        Ok(())
    }

    /// Extends a held lease to `new_locked_until`. Used by workers whose job
    /// runtime may exceed the lease duration.
    pub async fn renew_lease(
        &self,
        id: &str,
        worker_id: i64,
        new_locked_until: i64,
        now: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE jobs SET locked_until = ?1, updated_at = ?2
            WHERE id = ?3 AND state = 'processing' AND locked_by = ?4
            ",
        )
        .bind(new_locked_until)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        self.require_lease_hit(id, result.rows_affected()).await
    }

    /// Returns every job whose lease has expired to `pending`, without
    /// counting an attempt: the work simply did not complete. Returns the
    /// number of jobs reclaimed.
    pub async fn reclaim_expired_leases(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE jobs SET
                state = 'pending',
                locked_by = NULL,
                locked_until = NULL,
                updated_at = ?1
            WHERE state = 'processing' AND locked_until IS NOT NULL AND locked_until < ?1
            ",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Touches retry-deferred jobs whose `retry_at` has passed so `list`
    /// reflects their eligibility. Claiming consults `retry_at` directly, so
    /// no state flip happens here. Returns the number of jobs now due.
    pub async fn promote_ready_retries(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE jobs SET updated_at = ?1
            WHERE state = 'pending' AND retry_at IS NOT NULL AND retry_at <= ?1
            ",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Lists dead-letter entries, newest first.
    pub async fn dlq_list(&self, limit: i64) -> Result<Vec<DlqEntry>> {
        let entries =
            sqlx::query_as::<_, DlqEntry>("SELECT * FROM dlq ORDER BY moved_at DESC LIMIT ?1")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        Ok(entries)
    }

    /// Fetches a single dead-letter entry.
    pub async fn dlq_get(&self, job_id: &str) -> Result<Option<DlqEntry>> {
        let entry = sqlx::query_as::<_, DlqEntry>("SELECT * FROM dlq WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    /// Resurrects a dead job: removes its DLQ row and resets it to a fresh
    /// `pending` state with `attempts = 0`.
    pub async fn retry_from_dlq(&self, id: &str, now: i64) -> Result<Job> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM dlq WHERE job_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if removed.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound(id.to_owned()));
        }

        let job = sqlx::query_as::<_, Job>(
            r"
            UPDATE jobs SET
                state = 'pending',
                attempts = 0,
                locked_by = NULL,
                locked_until = NULL,
                retry_at = NULL,
                last_error = NULL,
                updated_at = ?1
            WHERE id = ?2
            RETURNING *
            ",
        )
        .bind(now)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = job else {
            tx.rollback().await?;
            return Err(StoreError::NotFound(id.to_owned()));
        };

        tx.commit().await?;
        debug!(job.id = id, "Job requeued from DLQ");
        Ok(job)
    }

    /// Raw config value, if set. Defaults live in [`crate::config`].
    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Sets a config value, overwriting any previous one.
    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO config (key, value) VALUES (?1, ?2)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            ",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Distinguishes `LeaseLost` from `NotFound` after a guarded UPDATE
    /// matched zero rows.
    async fn require_lease_hit(&self, id: &str, rows_affected: u64) -> Result<()> {
        if rows_affected == 1 {
            Ok(())
        } else {
            Err(self.lease_miss(id).await)
        }
    }

    async fn lease_miss(&self, id: &str) -> StoreError {
        match self.get(id).await {
            Ok(Some(_)) => StoreError::LeaseLost(id.to_owned()),
            Ok(None) => StoreError::NotFound(id.to_owned()),
            Err(err) => err,
        }
    }
}

fn truncate_error(error: &str) -> String {
    if error.len() <= ERROR_SNIPPET_LEN {
        return error.to_owned();
    }
    let mut cut = ERROR_SNIPPET_LEN;
    while !error.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &error[..cut])
}
