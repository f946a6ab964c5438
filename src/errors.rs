//! Error taxonomy for store operations.

use std::path::PathBuf;

/// Error type for job store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A job with the same id already exists.
    #[error("job already exists: {0}")]
    DuplicateId(String),

    /// The job (or DLQ entry) does not exist.
    #[error("job not found: {0}")]
    NotFound(String),

    /// The caller no longer holds the lease on the job.
    ///
    /// Raised when a state commit is attempted after the lease was reclaimed
    /// and possibly handed to another worker. The caller must not retry the
    /// commit.
    #[error("lease on job {0} is no longer held by this worker")]
    LeaseLost(String),

    /// An enqueue request failed validation before touching the database.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// A config value failed validation.
    #[error("invalid config value for {key}: {reason}")]
    InvalidConfig {
        /// The config key that failed to parse or validate.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The database file could not be opened.
    #[error("failed to open database at {}", path.display())]
    Open {
        /// Path to the database file.
        path: PathBuf,
        /// Underlying driver error.
        #[source]
        source: sqlx::Error,
    },

    /// The underlying database reported an I/O or protocol error.
    #[error("store unavailable")]
    Unavailable(#[from] sqlx::Error),
}

/// Convenience alias for store results.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

impl StoreError {
    /// Maps a sqlx error from an INSERT into `DuplicateId` when the primary
    /// key was violated, passing everything else through as `Unavailable`.
    pub(crate) fn on_insert(id: &str, err: sqlx::Error) -> Self {
        let unique = err
            .as_database_error()
            .is_some_and(|db| matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation));

        if unique {
            Self::DuplicateId(id.to_owned())
        } else {
            Self::Unavailable(err)
        }
    }
}
