//! The worker loop: claim one job, execute it, commit the result, repeat.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::backoff;
use crate::clock;
use crate::config::QueueConfig;
use crate::errors::StoreError;
use crate::executor::{self, ExecOutcome};
use crate::schema::Job;
use crate::storage::Store;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Run the housekeeping sweep every this many loop iterations.
const SWEEP_EVERY: u64 = 10;

/// A single worker. One OS process runs exactly one of these; the worker id
/// is that process's PID, which is what the job lease records.
pub struct Worker {
    store: Store,
    worker_id: i64,
    shutdown: CancellationToken,
    poll_interval: Duration,
    jitter: Duration,
    stop_when_idle: bool,
}

impl Worker {
    /// Creates a worker bound to `store`. `shutdown` is the cancellation
    /// token the process's signal handler trips; the worker polls it between
    /// jobs, never during one.
    pub fn new(store: Store, worker_id: i64, shutdown: CancellationToken) -> Self {
        Self {
            store,
            worker_id,
            shutdown,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            stop_when_idle: false,
        }
    }

    /// Set how long to sleep when no job is runnable.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter added to idle sleeps. Jitter keeps a
    /// pool of workers from hammering the store in lockstep.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Exit the loop as soon as no job is runnable, instead of polling
    /// forever. Used by tests that drain a queue and stop.
    pub fn stop_when_idle(mut self) -> Self {
        self.stop_when_idle = true;
        self
    }

    fn sleep_duration_with_jitter(&self) -> Duration {
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..=self.jitter)
        };
        self.poll_interval + jitter
    }

    /// Run jobs until shutdown is requested (or, with
    /// [`Self::stop_when_idle`], until the queue is drained).
    ///
    /// A job that has been claimed is always carried through its state
    /// commit before the loop re-checks the shutdown token, so stopping a
    /// worker never truncates a running job.
    pub async fn run(&self) {
        info!(worker.id = self.worker_id, "Worker started");

        let mut iteration: u64 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if iteration % SWEEP_EVERY == 0 {
                self.sweep().await;
            }
            iteration += 1;

            match self.run_next_job().await {
                Ok(Some(_)) => {}
                Ok(None) if self.stop_when_idle => {
                    debug!("No runnable jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No runnable jobs found. Polling again in {sleep_duration:?}…");
                    self.idle_sleep(sleep_duration).await;
                }
                Err(error) => {
                    error!("Failed to run job: {error:#}");
                    self.idle_sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }

        info!(worker.id = self.worker_id, "Worker stopped");
    }

    /// Idle sleep that wakes immediately when shutdown is requested.
    async fn idle_sleep(&self, duration: Duration) {
        tokio::select! {
            () = sleep(duration) => {}
            () = self.shutdown.cancelled() => {}
        }
    }

    /// Housekeeping: return expired leases to `pending` and surface due
    /// retries. Failures here are logged, not fatal; the next sweep retries.
    async fn sweep(&self) {
        let now = clock::now_ms();

        match self.store.reclaim_expired_leases(now).await {
            Ok(0) => {}
            Ok(count) => info!(count, "Reclaimed expired leases"),
            Err(error) => warn!(%error, "Lease reclaim sweep failed"),
        }

        if let Err(error) = self.store.promote_ready_retries(now).await {
            warn!(%error, "Retry promotion sweep failed");
        }
    }

    /// Claim and process the next runnable job, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run
    /// - `Ok(None)` if nothing was runnable
    /// - `Err(...)` if the store was unavailable
    async fn run_next_job(&self) -> anyhow::Result<Option<String>> {
        let config = QueueConfig::load(&self.store).await?;

        trace!("Looking for the next runnable job…");
        let now = clock::now_ms();
        let lease_ms = config.lock_lease_seconds.saturating_mul(1000);

        let Some(job) = self
            .store
            .claim_next_runnable(self.worker_id, now, lease_ms)
            .await?
        else {
            return Ok(None);
        };

        let span = info_span!("job", job.id = %job.id, job.attempts = job.attempts);
        let id = job.id.clone();
        self.process_claimed(job, &config).instrument(span).await?;

        Ok(Some(id))
    }

    async fn process_claimed(&self, job: Job, config: &QueueConfig) -> anyhow::Result<()> {
        let timeout = Duration::from_secs(config.job_timeout_seconds.max(1) as u64);

        debug!("Running job…");
        let outcome = self.execute_with_lease_renewal(&job, timeout, config).await;
        let now = clock::now_ms();

        if outcome.succeeded() {
            let committed = self
                .store
                .mark_completed(&job.id, self.worker_id, &outcome, now)
                .await;
            match committed {
                Ok(()) => info!("Job completed"),
                Err(err) => return self.swallow_lost_lease(err),
            }
            return Ok(());
        }

        let error = outcome.failure_message(timeout);
        let new_attempts = job.attempts + 1;

        if new_attempts <= job.max_retries {
            let delay_secs = backoff::retry_delay_secs(
                u32::try_from(new_attempts).unwrap_or(u32::MAX),
                config.backoff_base,
                config.max_backoff_seconds,
            );
            let retry_at = now + delay_secs.saturating_mul(1000);

            let committed = self
                .store
                .schedule_retry(
                    &job.id,
                    self.worker_id,
                    new_attempts,
                    retry_at,
                    &error,
                    &outcome,
                    now,
                )
                .await;
            match committed {
                Ok(()) => warn!(
                    delay_secs,
                    attempt = new_attempts,
                    max_retries = job.max_retries,
                    "Job failed, retry scheduled"
                ),
                Err(err) => return self.swallow_lost_lease(err),
            }
        } else {
            let reason = format!("max retries exceeded: {error}");
            let committed = self
                .store
                .move_to_dlq(&job.id, self.worker_id, &reason, &outcome, now)
                .await;
            match committed {
                Ok(()) => error!(attempts = new_attempts, "Job moved to DLQ"),
                Err(err) => return self.swallow_lost_lease(err),
            }
        }

        Ok(())
    }

    /// Runs the command while keeping the lease alive. The renewal ticker
    /// fires every half lease, so a job may legitimately outlive
    /// `lock_lease_seconds` (the default timeout does) without its lease
    /// expiring under it.
    async fn execute_with_lease_renewal(
        &self,
        job: &Job,
        timeout: Duration,
        config: &QueueConfig,
    ) -> ExecOutcome {
        let renew_every = Duration::from_secs((config.lock_lease_seconds as u64 / 2).max(1));
        let lease_ms = config.lock_lease_seconds.saturating_mul(1000);

        let exec = executor::run(&job.command, timeout);
        tokio::pin!(exec);

        let mut ticker = tokio::time::interval(renew_every);
        ticker.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                outcome = &mut exec => return outcome,
                _ = ticker.tick() => {
                    let now = clock::now_ms();
                    if let Err(error) = self
                        .store
                        .renew_lease(&job.id, self.worker_id, now + lease_ms, now)
                        .await
                    {
                        // The sweeper took the lease; the commit below will
                        // see LeaseLost and drop the result.
                        warn!(%error, "Failed to renew lease");
                    }
                }
            }
        }
    }

    /// A lost lease on commit means a sweeper reclaimed the job and someone
    /// else may own it now. The state change must not be retried, or a
    /// completed job could be re-completed over another worker's run.
    fn swallow_lost_lease(&self, err: StoreError) -> anyhow::Result<()> {
        match err {
            StoreError::LeaseLost(id) => {
                warn!(job.id = %id, "Lease lost before the result could be committed; dropping result");
                Ok(())
            }
            StoreError::NotFound(id) => {
                warn!(job.id = %id, "Job disappeared before the result could be committed");
                Ok(())
            }
            other => Err(other.into()),
        }
    }
}
