#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use claims::{assert_err, assert_none, assert_ok, assert_some};
use queuectl::executor::ExecOutcome;
use queuectl::storage::{NewJob, Store};
use queuectl::{JobState, StoreError, config};

/// Test utilities and common setup
mod test_utils {
    use super::*;

    /// Open a store backed by a fresh database file in a temp directory.
    /// The directory guard must be kept alive for the duration of the test.
    pub async fn open_store() -> anyhow::Result<(Store, tempfile::TempDir)> {
        let dir = tempfile::tempdir()?;
        let store = Store::open(dir.path().join("queue.db")).await?;
        Ok((store, dir))
    }

    pub fn new_job(id: &str, priority: i64) -> NewJob {
        NewJob {
            id: Some(id.to_owned()),
            command: "true".to_owned(),
            max_retries: 3,
            priority,
            run_at: None,
        }
    }

    pub fn success_outcome() -> ExecOutcome {
        ExecOutcome {
            exit_code: 0,
            stdout: "ok\n".to_owned(),
            stderr: String::new(),
            timed_out: false,
        }
    }

    pub fn failure_outcome() -> ExecOutcome {
        ExecOutcome {
            exit_code: 1,
            stdout: String::new(),
            stderr: "boom\n".to_owned(),
            timed_out: false,
        }
    }
}

use test_utils::{failure_outcome, new_job, open_store, success_outcome};

const LEASE_MS: i64 = 300_000;

#[tokio::test]
async fn enqueue_and_get_round_trip() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;

    let job = store.enqueue(new_job("e1", 5), 1_000).await?;
    assert_eq!(job.id, "e1");
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.priority, 5);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.created_at, 1_000);
    assert_none!(job.locked_by);
    assert_none!(job.locked_until);

    let fetched = assert_some!(store.get("e1").await?);
    assert_eq!(fetched.command, "true");

    assert_none!(store.get("missing").await?);
    Ok(())
}

#[tokio::test]
async fn generates_an_id_when_none_is_given() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;

    let mut job = new_job("ignored", 0);
    job.id = None;
    let stored = store.enqueue(job, 1_000).await?;
    assert!(!stored.id.is_empty());
    assert_some!(store.get(&stored.id).await?);
    Ok(())
}

#[tokio::test]
async fn duplicate_id_is_rejected_without_mutation() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;

    store.enqueue(new_job("e7", 0), 1_000).await?;

    let mut second = new_job("e7", 9);
    second.command = "echo other".to_owned();
    let err = assert_err!(store.enqueue(second, 2_000).await);
    assert!(matches!(err, StoreError::DuplicateId(id) if id == "e7"));

    // The original row is untouched.
    let job = assert_some!(store.get("e7").await?);
    assert_eq!(job.command, "true");
    assert_eq!(job.priority, 0);
    assert_eq!(job.updated_at, 1_000);
    Ok(())
}

#[tokio::test]
async fn enqueue_validates_inputs() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;

    let mut blank = new_job("a", 0);
    blank.command = "   ".to_owned();
    assert!(matches!(
        assert_err!(store.enqueue(blank, 1_000).await),
        StoreError::InvalidJob(_)
    ));

    assert!(matches!(
        assert_err!(store.enqueue(new_job("b", 11), 1_000).await),
        StoreError::InvalidJob(_)
    ));

    let mut negative = new_job("c", 0);
    negative.max_retries = -1;
    assert!(matches!(
        assert_err!(store.enqueue(negative, 1_000).await),
        StoreError::InvalidJob(_)
    ));
    Ok(())
}

#[tokio::test]
async fn claim_stamps_the_lease() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;
    store.enqueue(new_job("e1", 0), 1_000).await?;

    let job = assert_some!(store.claim_next_runnable(42, 5_000, LEASE_MS).await?);
    assert_eq!(job.id, "e1");
    assert_eq!(job.state, JobState::Processing);
    assert_eq!(assert_some!(job.locked_by), 42);
    assert_eq!(assert_some!(job.locked_until), 5_000 + LEASE_MS);
    assert_eq!(job.updated_at, 5_000);

    // The same job cannot be claimed again while the lease is live.
    assert_none!(store.claim_next_runnable(43, 6_000, LEASE_MS).await?);
    Ok(())
}

#[tokio::test]
async fn claim_prefers_priority_class_then_fifo() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;
    store.enqueue(new_job("a", 0), 1_000).await?;
    store.enqueue(new_job("b", 0), 1_001).await?;
    store.enqueue(new_job("u", 10), 1_002).await?;

    let first = assert_some!(store.claim_next_runnable(1, 2_000, LEASE_MS).await?);
    let second = assert_some!(store.claim_next_runnable(1, 2_000, LEASE_MS).await?);
    let third = assert_some!(store.claim_next_runnable(1, 2_000, LEASE_MS).await?);
    assert_eq!(first.id, "u");
    assert_eq!(second.id, "a");
    assert_eq!(third.id, "b");
    assert_none!(store.claim_next_runnable(1, 2_000, LEASE_MS).await?);
    Ok(())
}

#[tokio::test]
async fn claim_orders_by_priority_within_the_priority_class() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;
    store.enqueue(new_job("low", 3), 1_000).await?;
    store.enqueue(new_job("high", 8), 1_001).await?;
    store.enqueue(new_job("older-high", 8), 999).await?;

    let first = assert_some!(store.claim_next_runnable(1, 2_000, LEASE_MS).await?);
    let second = assert_some!(store.claim_next_runnable(1, 2_000, LEASE_MS).await?);
    let third = assert_some!(store.claim_next_runnable(1, 2_000, LEASE_MS).await?);
    assert_eq!(first.id, "older-high");
    assert_eq!(second.id, "high");
    assert_eq!(third.id, "low");
    Ok(())
}

#[tokio::test]
async fn same_millisecond_enqueues_keep_insertion_order() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;
    store.enqueue(new_job("first", 0), 1_000).await?;
    store.enqueue(new_job("second", 0), 1_000).await?;

    let first = assert_some!(store.claim_next_runnable(1, 2_000, LEASE_MS).await?);
    assert_eq!(first.id, "first");
    Ok(())
}

#[tokio::test]
async fn claim_respects_run_at_and_retry_at() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;

    let mut scheduled = new_job("later", 0);
    scheduled.run_at = Some(10_000);
    store.enqueue(scheduled, 1_000).await?;

    assert_none!(store.claim_next_runnable(1, 9_999, LEASE_MS).await?);
    let job = assert_some!(store.claim_next_runnable(1, 10_000, LEASE_MS).await?);
    assert_eq!(job.id, "later");

    // Same deferral through retry_at.
    store.enqueue(new_job("retryer", 0), 1_000).await?;
    let claimed = assert_some!(store.claim_next_runnable(1, 11_000, LEASE_MS).await?);
    store
        .schedule_retry(&claimed.id, 1, 1, 20_000, "exit code 1", &failure_outcome(), 11_500)
        .await?;

    assert_none!(store.claim_next_runnable(1, 19_999, LEASE_MS).await?);
    let job = assert_some!(store.claim_next_runnable(1, 20_000, LEASE_MS).await?);
    assert_eq!(job.id, "retryer");
    Ok(())
}

#[tokio::test]
async fn concurrent_claims_never_hand_out_the_same_job() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;
    for i in 0..8 {
        store.enqueue(new_job(&format!("job-{i}"), 0), 1_000 + i).await?;
    }

    let mut handles = Vec::new();
    for worker_id in 1..=4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Ok(Some(job)) = store.claim_next_runnable(worker_id, 5_000, LEASE_MS).await {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all: Vec<String> = Vec::new();
    for handle in handles {
        all.extend(handle.await?);
    }

    all.sort();
    let before_dedup = all.len();
    all.dedup();
    assert_eq!(before_dedup, all.len(), "a job was claimed twice");
    assert_eq!(all.len(), 8);
    Ok(())
}

#[tokio::test]
async fn mark_completed_requires_the_lease() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;
    store.enqueue(new_job("e1", 0), 1_000).await?;
    let job = assert_some!(store.claim_next_runnable(1, 2_000, LEASE_MS).await?);

    // Another worker cannot complete it.
    let err = assert_err!(store.mark_completed(&job.id, 2, &success_outcome(), 3_000).await);
    assert!(matches!(err, StoreError::LeaseLost(_)));

    assert_ok!(store.mark_completed(&job.id, 1, &success_outcome(), 3_000).await);
    let done = assert_some!(store.get("e1").await?);
    assert_eq!(done.state, JobState::Completed);
    assert_none!(done.locked_by);
    assert_none!(done.locked_until);
    assert_eq!(assert_some!(done.exit_code), 0);
    assert_eq!(assert_some!(done.completed_at), 3_000);
    assert_eq!(done.attempts, 0);

    // Unknown job ids surface as NotFound, not LeaseLost.
    let err = assert_err!(store.mark_completed("missing", 1, &success_outcome(), 3_000).await);
    assert!(matches!(err, StoreError::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn schedule_retry_records_the_failure() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;
    store.enqueue(new_job("e2", 0), 1_000).await?;
    let job = assert_some!(store.claim_next_runnable(7, 2_000, LEASE_MS).await?);

    store
        .schedule_retry(&job.id, 7, 1, 4_000, "exit code 1: boom", &failure_outcome(), 2_500)
        .await?;

    let retried = assert_some!(store.get("e2").await?);
    assert_eq!(retried.state, JobState::Pending);
    assert_eq!(retried.attempts, 1);
    assert_eq!(assert_some!(retried.retry_at), 4_000);
    assert_eq!(assert_some!(retried.last_error), "exit code 1: boom");
    assert_eq!(assert_some!(retried.exit_code), 1);
    assert_none!(retried.locked_by);
    assert_none!(retried.locked_until);
    Ok(())
}

#[tokio::test]
async fn move_to_dlq_counts_the_final_attempt() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;
    store.enqueue(new_job("e3", 0), 1_000).await?;
    let job = assert_some!(store.claim_next_runnable(7, 2_000, LEASE_MS).await?);

    store
        .move_to_dlq(&job.id, 7, "max retries exceeded: exit code 1", &failure_outcome(), 3_000)
        .await?;

    let dead = assert_some!(store.get("e3").await?);
    assert_eq!(dead.state, JobState::Dead);
    assert_eq!(dead.attempts, 1);
    assert_none!(dead.locked_by);
    assert_none!(dead.locked_until);

    let entry = assert_some!(store.dlq_get("e3").await?);
    assert_eq!(entry.moved_at, 3_000);
    assert!(entry.reason.contains("max retries exceeded"));
    assert!(entry.payload.contains("\"e3\""));

    // Dead jobs are not claimable.
    assert_none!(store.claim_next_runnable(7, 10_000, LEASE_MS).await?);
    Ok(())
}

#[tokio::test]
async fn retry_from_dlq_resurrects_the_job() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;
    store.enqueue(new_job("e3", 0), 1_000).await?;
    let job = assert_some!(store.claim_next_runnable(7, 2_000, LEASE_MS).await?);
    store
        .move_to_dlq(&job.id, 7, "max retries exceeded", &failure_outcome(), 3_000)
        .await?;

    let revived = store.retry_from_dlq("e3", 4_000).await?;
    assert_eq!(revived.state, JobState::Pending);
    assert_eq!(revived.attempts, 0);
    assert_none!(revived.retry_at);
    assert_none!(revived.last_error);
    assert_none!(store.dlq_get("e3").await?);

    // Runnable again right away.
    let reclaimed = assert_some!(store.claim_next_runnable(8, 5_000, LEASE_MS).await?);
    assert_eq!(reclaimed.id, "e3");

    // Only DLQ'd jobs can be retried this way.
    let err = assert_err!(store.retry_from_dlq("e3", 6_000).await);
    assert!(matches!(err, StoreError::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn reclaim_returns_expired_leases_to_pending() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;
    store.enqueue(new_job("e5", 0), 1_000).await?;
    let job = assert_some!(store.claim_next_runnable(1, 2_000, 1_000).await?);
    assert_eq!(assert_some!(job.locked_until), 3_000);

    // Lease still live: nothing to reclaim.
    assert_eq!(store.reclaim_expired_leases(2_500).await?, 0);

    // Lease expired: the job goes back to pending with attempts untouched.
    assert_eq!(store.reclaim_expired_leases(3_001).await?, 1);
    let reclaimed = assert_some!(store.get("e5").await?);
    assert_eq!(reclaimed.state, JobState::Pending);
    assert_eq!(reclaimed.attempts, 0);
    assert_none!(reclaimed.locked_by);
    assert_none!(reclaimed.retry_at);

    // And is immediately claimable by another worker.
    let next = assert_some!(store.claim_next_runnable(2, 3_002, 1_000).await?);
    assert_eq!(next.id, "e5");
    Ok(())
}

#[tokio::test]
async fn commits_after_reclaim_fail_with_lease_lost() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;
    store.enqueue(new_job("e5", 0), 1_000).await?;
    let job = assert_some!(store.claim_next_runnable(1, 2_000, 1_000).await?);

    store.reclaim_expired_leases(4_000).await?;

    let err = assert_err!(store.mark_completed(&job.id, 1, &success_outcome(), 4_100).await);
    assert!(matches!(err, StoreError::LeaseLost(_)));

    let err = assert_err!(
        store
            .schedule_retry(&job.id, 1, 1, 5_000, "late", &failure_outcome(), 4_100)
            .await
    );
    assert!(matches!(err, StoreError::LeaseLost(_)));

    let err = assert_err!(
        store
            .move_to_dlq(&job.id, 1, "late", &failure_outcome(), 4_100)
            .await
    );
    assert!(matches!(err, StoreError::LeaseLost(_)));

    // The reclaim left the job pending and unclaimed.
    let job = assert_some!(store.get("e5").await?);
    assert_eq!(job.state, JobState::Pending);
    Ok(())
}

#[tokio::test]
async fn renew_lease_extends_the_expiry() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;
    store.enqueue(new_job("long", 0), 1_000).await?;
    let job = assert_some!(store.claim_next_runnable(1, 2_000, 1_000).await?);

    store.renew_lease(&job.id, 1, 10_000, 2_900).await?;

    // The old expiry has passed, but the renewed lease holds.
    assert_eq!(store.reclaim_expired_leases(3_500).await?, 0);
    let held = assert_some!(store.get("long").await?);
    assert_eq!(held.state, JobState::Processing);
    assert_eq!(assert_some!(held.locked_until), 10_000);

    // Renewal from a worker that does not hold the lease is refused.
    let err = assert_err!(store.renew_lease(&job.id, 2, 99_000, 3_600).await);
    assert!(matches!(err, StoreError::LeaseLost(_)));
    Ok(())
}

#[tokio::test]
async fn counts_jobs_per_state() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;
    store.enqueue(new_job("p1", 0), 1_000).await?;
    store.enqueue(new_job("p2", 0), 1_001).await?;
    store.enqueue(new_job("c1", 0), 1_002).await?;
    store.enqueue(new_job("d1", 0), 1_003).await?;

    let job = assert_some!(store.claim_next_runnable(1, 2_000, LEASE_MS).await?);
    store.mark_completed(&job.id, 1, &success_outcome(), 2_100).await?;
    let job = assert_some!(store.claim_next_runnable(1, 2_200, LEASE_MS).await?);
    store
        .move_to_dlq(&job.id, 1, "max retries exceeded", &failure_outcome(), 2_300)
        .await?;
    assert_some!(store.claim_next_runnable(1, 2_400, LEASE_MS).await?);

    let counts = store.counts().await?;
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.processing, 1);
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.dead, 1);
    Ok(())
}

#[tokio::test]
async fn list_filters_by_state_and_limits() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;
    for i in 0..5 {
        store.enqueue(new_job(&format!("job-{i}"), 0), 1_000 + i).await?;
    }
    let job = assert_some!(store.claim_next_runnable(1, 2_000, LEASE_MS).await?);
    store.mark_completed(&job.id, 1, &success_outcome(), 2_100).await?;

    assert_eq!(store.list(None, 100).await?.len(), 5);
    assert_eq!(store.list(Some(JobState::Pending), 100).await?.len(), 4);
    assert_eq!(store.list(Some(JobState::Completed), 100).await?.len(), 1);
    assert_eq!(store.list(None, 2).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn dlq_list_is_newest_first() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;
    for (i, id) in ["old", "new"].iter().enumerate() {
        store.enqueue(new_job(id, 0), 1_000 + i as i64).await?;
        let job = assert_some!(store.claim_next_runnable(1, 2_000 + i as i64, LEASE_MS).await?);
        store
            .move_to_dlq(&job.id, 1, "max retries exceeded", &failure_outcome(), 3_000 + i as i64)
            .await?;
    }

    let entries = store.dlq_list(10).await?;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].job_id, "new");
    assert_eq!(entries[1].job_id, "old");
    Ok(())
}

#[tokio::test]
async fn config_defaults_and_overrides() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;

    assert_eq!(config::get(&store, config::MAX_RETRIES).await?, "3");
    assert_eq!(config::get(&store, config::BACKOFF_BASE).await?, "2");
    assert_eq!(config::get(&store, config::JOB_TIMEOUT_SECONDS).await?, "3600");

    config::set(&store, config::MAX_RETRIES, "5").await?;
    assert_eq!(config::get(&store, config::MAX_RETRIES).await?, "5");

    let snapshot = config::QueueConfig::load(&store).await?;
    assert_eq!(snapshot.max_retries, 5);
    assert_eq!(snapshot.lock_lease_seconds, 300);

    assert!(matches!(
        assert_err!(config::get(&store, "nope").await),
        StoreError::InvalidConfig { .. }
    ));
    assert!(matches!(
        assert_err!(config::set(&store, config::BACKOFF_BASE, "zero").await),
        StoreError::InvalidConfig { .. }
    ));
    assert!(matches!(
        assert_err!(config::set(&store, config::BACKOFF_BASE, "0").await),
        StoreError::InvalidConfig { .. }
    ));
    Ok(())
}

#[tokio::test]
async fn promote_ready_retries_reports_due_jobs() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await?;
    store.enqueue(new_job("r1", 0), 1_000).await?;
    let job = assert_some!(store.claim_next_runnable(1, 2_000, LEASE_MS).await?);
    store
        .schedule_retry(&job.id, 1, 1, 5_000, "exit code 1", &failure_outcome(), 2_100)
        .await?;

    assert_eq!(store.promote_ready_retries(4_999).await?, 0);
    assert_eq!(store.promote_ready_retries(5_000).await?, 1);
    Ok(())
}
