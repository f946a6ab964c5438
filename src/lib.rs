#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

/// Exponential retry backoff.
pub mod backoff;
/// Command-line surface.
pub mod cli;
/// Wall-clock access and timestamp formatting.
pub mod clock;
/// Runtime configuration with typed accessors.
pub mod config;
mod errors;
/// Shell command execution with timeout enforcement.
pub mod executor;
/// Logging setup.
pub mod logs;
/// Database row types.
pub mod schema;
/// Durable job storage.
pub mod storage;
/// Worker process supervision.
pub mod supervisor;
/// The worker loop.
pub mod worker;

/// Error type for job store operations.
pub use self::errors::StoreError;
/// A job record and its lifecycle state.
pub use self::schema::{Job, JobState};
/// The durable job store and its enqueue input.
pub use self::storage::{NewJob, Store};
/// A single job-processing worker.
pub use self::worker::Worker;
