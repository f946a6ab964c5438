//! Runtime configuration.
//!
//! Tunables live in the string-keyed `config` table so `queuectl config set`
//! takes effect for already-running workers. Values are parsed and
//! range-checked at read time; missing keys fall back to the defaults below.

use crate::errors::{Result, StoreError};
use crate::storage::Store;

/// Key for the default retry budget of new jobs.
pub const MAX_RETRIES: &str = "max_retries";
/// Key for the exponential backoff base.
pub const BACKOFF_BASE: &str = "backoff_base";
/// Key for the backoff cap, in seconds.
pub const MAX_BACKOFF_SECONDS: &str = "max_backoff_seconds";
/// Key for the lease duration stamped on claimed jobs, in seconds.
pub const LOCK_LEASE_SECONDS: &str = "lock_lease_seconds";
/// Key for the wall-clock execution timeout, in seconds.
pub const JOB_TIMEOUT_SECONDS: &str = "job_timeout_seconds";

/// Every recognized key with its default value.
pub const DEFAULTS: [(&str, &str); 5] = [
    (MAX_RETRIES, "3"),
    (BACKOFF_BASE, "2"),
    (MAX_BACKOFF_SECONDS, "300"),
    (LOCK_LEASE_SECONDS, "300"),
    (JOB_TIMEOUT_SECONDS, "3600"),
];

/// A parsed snapshot of every tunable. Workers re-load this each claim cycle
/// so config changes apply without a restart.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Default retry budget for jobs enqueued without an explicit one.
    pub max_retries: i64,
    /// Base of the exponential backoff.
    pub backoff_base: i64,
    /// Cap on a single retry delay, in seconds.
    pub max_backoff_seconds: i64,
    /// Lease duration for claimed jobs, in seconds.
    pub lock_lease_seconds: i64,
    /// Wall-clock timeout for a single execution, in seconds.
    pub job_timeout_seconds: i64,
}

impl QueueConfig {
    /// Loads and validates the full config snapshot.
    pub async fn load(store: &Store) -> Result<Self> {
        Ok(Self {
            max_retries: get_i64(store, MAX_RETRIES).await?,
            backoff_base: get_i64(store, BACKOFF_BASE).await?,
            max_backoff_seconds: get_i64(store, MAX_BACKOFF_SECONDS).await?,
            lock_lease_seconds: get_i64(store, LOCK_LEASE_SECONDS).await?,
            job_timeout_seconds: get_i64(store, JOB_TIMEOUT_SECONDS).await?,
        })
    }
}

/// The effective value for `key`: the stored one, or its default.
/// Unknown keys are user errors.
pub async fn get(store: &Store, key: &str) -> Result<String> {
    let default = default_for(key)?;
    Ok(store.get_config(key).await?.unwrap_or_else(|| default.to_owned()))
}

/// Validates and stores a config value.
pub async fn set(store: &Store, key: &str, value: &str) -> Result<()> {
    validate(key, value)?;
    store.set_config(key, value).await
}

/// Checks that `key` is recognized and `value` parses within its range.
pub fn validate(key: &str, value: &str) -> Result<()> {
    default_for(key)?;

    let parsed: i64 = value.trim().parse().map_err(|_| StoreError::InvalidConfig {
        key: key.to_owned(),
        reason: format!("expected an integer, got {value:?}"),
    })?;

    let min = match key {
        MAX_RETRIES => 0,
        BACKOFF_BASE => 1,
        _ => 1,
    };
    if parsed < min {
        return Err(StoreError::InvalidConfig {
            key: key.to_owned(),
            reason: format!("must be at least {min}, got {parsed}"),
        });
    }
    Ok(())
}

fn default_for(key: &str) -> Result<&'static str> {
    DEFAULTS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, default)| *default)
        .ok_or_else(|| StoreError::InvalidConfig {
            key: key.to_owned(),
            reason: "unknown key".to_owned(),
        })
}

async fn get_i64(store: &Store, key: &str) -> Result<i64> {
    let raw = get(store, key).await?;
    validate(key, &raw)?;
    raw.trim().parse().map_err(|_| StoreError::InvalidConfig {
        key: key.to_owned(),
        reason: format!("expected an integer, got {raw:?}"),
    })
}
