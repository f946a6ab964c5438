//! Command-line surface.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock;
use crate::config;
use crate::schema::JobState;
use crate::storage::{NewJob, Store};
use crate::supervisor::{PID_FILE, Supervisor};
use crate::worker::Worker;

/// QueueCTL - a CLI-based background job queue.
#[derive(Debug, Parser)]
#[command(name = "queuectl", version, about, long_about = None)]
pub struct Cli {
    /// Path to the queue database file.
    #[arg(long, global = true, default_value = "queue.db")]
    pub db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Enqueue a new job, as JSON or with flags.
    Enqueue {
        /// Job JSON, e.g. '{"id":"job1","command":"sleep 2"}'.
        job_json: Option<String>,

        /// Job id; generated when omitted.
        #[arg(long)]
        id: Option<String>,

        /// Command to execute.
        #[arg(long)]
        command: Option<String>,

        /// Max retries; defaults to the configured `max_retries`.
        #[arg(long = "retries")]
        max_retries: Option<i64>,

        /// Priority (0-10, higher = more urgent).
        #[arg(long, default_value_t = 0)]
        priority: i64,

        /// Earliest execution time, e.g. 2025-11-08T15:30:00.
        #[arg(long = "run-at")]
        run_at: Option<String>,
    },

    /// Show job counts per state and active worker PIDs.
    Status,

    /// List jobs, optionally filtered by state.
    List {
        /// Filter by state (pending/processing/completed/dead).
        #[arg(long)]
        state: Option<String>,

        /// Maximum number of jobs to list.
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },

    /// Manage worker processes.
    #[command(subcommand)]
    Worker(WorkerCommand),

    /// Manage the dead-letter queue.
    #[command(subcommand)]
    Dlq(DlqCommand),

    /// View captured job output.
    #[command(subcommand)]
    Output(OutputCommand),

    /// Read and write configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
enum WorkerCommand {
    /// Start worker processes.
    Start {
        /// Number of worker processes to start.
        #[arg(long, default_value_t = 1)]
        count: usize,
    },

    /// Stop all recorded worker processes gracefully.
    Stop,

    /// Run a worker loop in this process (used by `worker start`).
    #[command(hide = true)]
    Run {
        /// Ordinal of this worker within its batch, for log context.
        #[arg(long, default_value_t = 0)]
        worker_index: usize,
    },
}

#[derive(Debug, Subcommand)]
enum DlqCommand {
    /// List dead-lettered jobs.
    List {
        /// Maximum number of entries to list.
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },

    /// Requeue a job from the DLQ.
    Retry {
        /// Id of the dead job.
        job_id: String,
    },
}

#[derive(Debug, Subcommand)]
enum OutputCommand {
    /// Show the captured output of a job's most recent execution.
    Get {
        /// Job id.
        job_id: String,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Get a configuration value.
    Get {
        /// Configuration key.
        key: String,
    },

    /// Set a configuration value.
    Set {
        /// Configuration key.
        key: String,
        /// Configuration value.
        value: String,
    },
}

/// JSON form of an enqueue request.
#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    id: Option<String>,
    command: Option<String>,
    max_retries: Option<i64>,
    priority: Option<i64>,
    run_at: Option<String>,
}

/// Dispatches a parsed invocation. Every error bubbles to `main`, which
/// reports it and exits non-zero.
pub async fn run(cli: Cli) -> Result<()> {
    let store = Store::open(&cli.db).await?;

    match cli.command {
        Command::Enqueue {
            job_json,
            id,
            command,
            max_retries,
            priority,
            run_at,
        } => {
            let request = match job_json {
                Some(json) => serde_json::from_str::<EnqueueRequest>(&json)
                    .context("invalid job JSON")?,
                None => EnqueueRequest {
                    id,
                    command,
                    max_retries,
                    priority: Some(priority),
                    run_at,
                },
            };
            enqueue(&store, request).await
        }
        Command::Status => status(&store, &cli.db).await,
        Command::List { state, limit } => list(&store, state, limit).await,
        Command::Worker(WorkerCommand::Start { count }) => worker_start(&cli.db, count),
        Command::Worker(WorkerCommand::Stop) => worker_stop(&cli.db),
        Command::Worker(WorkerCommand::Run { worker_index }) => {
            worker_run(store, worker_index).await
        }
        Command::Dlq(DlqCommand::List { limit }) => dlq_list(&store, limit).await,
        Command::Dlq(DlqCommand::Retry { job_id }) => dlq_retry(&store, &job_id).await,
        Command::Output(OutputCommand::Get { job_id }) => output_get(&store, &job_id).await,
        Command::Config(ConfigCommand::Get { key }) => {
            let value = config::get(&store, &key).await?;
            println!("{key} = {value}");
            Ok(())
        }
        Command::Config(ConfigCommand::Set { key, value }) => {
            config::set(&store, &key, &value).await?;
            println!("Configuration updated: {key} = {value}");
            Ok(())
        }
    }
}

async fn enqueue(store: &Store, request: EnqueueRequest) -> Result<()> {
    let Some(command) = request.command else {
        bail!("a command is required (use --command or the \"command\" JSON field)");
    };

    let max_retries = match request.max_retries {
        Some(retries) => retries,
        None => config::get(store, config::MAX_RETRIES)
            .await?
            .parse()
            .context("configured max_retries is not an integer")?,
    };

    let priority = request.priority.unwrap_or(0);

    let run_at = request
        .run_at
        .as_deref()
        .map(|raw| {
            clock::parse_timestamp(raw)
                .with_context(|| format!("invalid --run-at timestamp: {raw}"))
        })
        .transpose()?;

    let job = store
        .enqueue(
            NewJob {
                id: request.id,
                command,
                max_retries,
                priority,
                run_at,
            },
            clock::now_ms(),
        )
        .await?;

    let mut message = format!("Job {} enqueued.", job.id);
    if job.priority > 0 {
        message.push_str(&format!(" (priority={})", job.priority));
    }
    if let Some(run_at) = job.run_at {
        message.push_str(&format!(" (scheduled for {})", clock::format_ms(run_at)));
    }
    println!("{message}");
    Ok(())
}

async fn status(store: &Store, db_path: &std::path::Path) -> Result<()> {
    // Opportunistic sweep, so status is accurate even with no worker running.
    let now = clock::now_ms();
    store.reclaim_expired_leases(now).await?;
    store.promote_ready_retries(now).await?;

    let counts = store.counts().await?;

    println!("Job counts:");
    for state in JobState::ALL {
        println!("  {:<12} {:>6}", state.to_string(), counts.get(state));
    }

    let supervisor = Supervisor::new(db_path, PID_FILE);
    let workers = supervisor.alive_workers()?;
    if workers.is_empty() {
        println!("\nNo active workers.");
    } else {
        let pids = workers
            .iter()
            .map(|pid| pid.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        println!("\nActive workers: {pids}");
    }
    Ok(())
}

async fn list(store: &Store, state: Option<String>, limit: i64) -> Result<()> {
    let state = state
        .as_deref()
        .map(|raw| JobState::from_str(raw).map_err(anyhow::Error::msg))
        .transpose()?;

    let jobs = store.list(state, limit).await?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<36} {:<10} {:>3} {:>3} {:<40} {:<20} {:<20}",
        "ID", "STATE", "PRI", "ATT", "COMMAND", "RUN AT", "RETRY AT"
    );
    for job in &jobs {
        println!(
            "{:<36} {:<10} {:>3} {:>3} {:<40} {:<20} {:<20}",
            truncate(&job.id, 36),
            job.state.to_string(),
            job.priority,
            job.attempts,
            truncate(&job.command, 40),
            job.run_at.map(clock::format_ms).unwrap_or_else(|| "-".into()),
            job.retry_at.map(clock::format_ms).unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}

fn worker_start(db_path: &std::path::Path, count: usize) -> Result<()> {
    if count < 1 {
        bail!("count must be >= 1");
    }

    let supervisor = Supervisor::new(db_path, PID_FILE);
    let pids = supervisor.start(count)?;

    for pid in &pids {
        println!("Worker started with PID {pid}");
    }
    println!("Worker PIDs recorded in {}", supervisor.pid_file().display());
    Ok(())
}

fn worker_stop(db_path: &std::path::Path) -> Result<()> {
    let supervisor = Supervisor::new(db_path, PID_FILE);
    let signaled = supervisor.stop()?;

    if signaled == 0 {
        println!("No worker processes to stop.");
    } else {
        println!("Sent shutdown signal to {signaled} worker(s); they exit after their current job.");
    }
    Ok(())
}

async fn worker_run(store: Store, worker_index: usize) -> Result<()> {
    let shutdown = CancellationToken::new();
    install_signal_handler(shutdown.clone())?;

    info!(worker.index = worker_index, "Worker process starting");
    let worker = Worker::new(store, i64::from(std::process::id()), shutdown);
    worker.run().await;
    Ok(())
}

#[cfg(unix)]
fn install_signal_handler(shutdown: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        info!("Shutdown signal received; finishing the current job");
        shutdown.cancel();
    });
    Ok(())
}

#[cfg(not(unix))]
fn install_signal_handler(shutdown: CancellationToken) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received; finishing the current job");
            shutdown.cancel();
        }
    });
    Ok(())
}

async fn dlq_list(store: &Store, limit: i64) -> Result<()> {
    let entries = store.dlq_list(limit).await?;
    if entries.is_empty() {
        println!("No jobs in the DLQ.");
        return Ok(());
    }

    println!("{:<36} {:<20} {:<60}", "JOB ID", "MOVED AT", "REASON");
    for entry in &entries {
        println!(
            "{:<36} {:<20} {:<60}",
            truncate(&entry.job_id, 36),
            clock::format_ms(entry.moved_at),
            truncate(&entry.reason, 60),
        );
    }
    Ok(())
}

async fn dlq_retry(store: &Store, job_id: &str) -> Result<()> {
    store.retry_from_dlq(job_id, clock::now_ms()).await?;
    println!("Job {job_id} requeued.");
    Ok(())
}

async fn output_get(store: &Store, job_id: &str) -> Result<()> {
    let job = store
        .get(job_id)
        .await?
        .with_context(|| format!("job not found: {job_id}"))?;

    println!("Job output: {job_id}");
    match job.completed_at {
        Some(ts) => println!("Completed at: {}", clock::format_ms(ts)),
        None => println!("Completed at: -"),
    }
    match job.exit_code {
        Some(code) => println!("Exit code: {code}"),
        None => println!("Exit code: - (not executed yet)"),
    }

    let stdout = job.stdout_log.unwrap_or_default();
    let stderr = job.stderr_log.unwrap_or_default();

    if !stdout.is_empty() {
        println!("\nSTDOUT:\n{stdout}");
    }
    if !stderr.is_empty() {
        println!("\nSTDERR:\n{stderr}");
    }
    if stdout.is_empty() && stderr.is_empty() {
        println!("\nNo output captured.");
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_owned();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}
