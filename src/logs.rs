//! Logging setup.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Name of the append-only log file, written next to the queue database.
pub const LOG_FILE: &str = "queuectl.log";

/// Initializes `tracing` with two layers: a compact console layer on stderr
/// (stdout is reserved for command output) and a non-blocking append-only
/// file layer. Levels come from `RUST_LOG`, defaulting to `info`.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// duration of the process.
pub fn init() -> WorkerGuard {
    let file_appender = tracing_appender::rolling::never(".", LOG_FILE);
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}
