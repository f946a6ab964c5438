//! Worker process supervision.
//!
//! `worker start` spawns N detached copies of this binary running the hidden
//! `worker run` subcommand and records their PIDs in a well-known file.
//! `worker stop` reads that file back and delivers SIGTERM to each recorded
//! process. Shutdown is cooperative: a worker finishes and commits its
//! in-flight job before exiting, so no forced kill happens here.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Default name of the worker PID file, one PID per line.
pub const PID_FILE: &str = ".queuectl.pid";

/// Manages the worker process pool for one queue database.
pub struct Supervisor {
    db_path: PathBuf,
    pid_file: PathBuf,
}

impl Supervisor {
    /// A supervisor for workers bound to `db_path`, tracked in `pid_file`.
    pub fn new(db_path: impl Into<PathBuf>, pid_file: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            pid_file: pid_file.into(),
        }
    }

    /// Spawns `count` worker processes and appends their PIDs to the PID
    /// file. Workers outlive this invocation; they stop on SIGTERM/SIGINT.
    pub fn start(&self, count: usize) -> Result<Vec<u32>> {
        let exe = std::env::current_exe().context("failed to locate the queuectl binary")?;

        let mut pids = Vec::with_capacity(count);
        for index in 0..count {
            let child = Command::new(&exe)
                .arg("--db")
                .arg(&self.db_path)
                .arg("worker")
                .arg("run")
                .arg("--worker-index")
                .arg(index.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .with_context(|| format!("failed to spawn worker {index}"))?;

            info!(worker.index = index, worker.pid = child.id(), "Worker spawned");
            pids.push(child.id());
        }

        self.append_pids(&pids)
            .context("workers started, but their PIDs could not be recorded")?;
        Ok(pids)
    }

    /// Sends SIGTERM to every recorded worker and clears the PID file.
    /// Returns how many processes were actually signaled.
    pub fn stop(&self) -> Result<usize> {
        let pids = self.read_pids()?;

        let mut signaled = 0;
        for pid in &pids {
            match terminate(*pid) {
                Ok(()) => {
                    info!(worker.pid = pid, "Sent shutdown signal");
                    signaled += 1;
                }
                Err(err) => {
                    warn!(worker.pid = pid, %err, "Worker not signaled (already stopped?)");
                }
            }
        }

        if self.pid_file.exists() {
            fs::remove_file(&self.pid_file).context("failed to remove the PID file")?;
        }
        Ok(signaled)
    }

    /// The recorded PIDs that still map to a live process.
    pub fn alive_workers(&self) -> Result<Vec<u32>> {
        Ok(self
            .read_pids()?
            .into_iter()
            .filter(|&pid| is_alive(pid))
            .collect())
    }

    /// Path of the PID file.
    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    fn read_pids(&self) -> Result<Vec<u32>> {
        if !self.pid_file.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.pid_file)
            .with_context(|| format!("failed to read {}", self.pid_file.display()))?;

        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    fn append_pids(&self, pids: &[u32]) -> Result<()> {
        let mut all = self.read_pids()?;
        all.extend_from_slice(pids);

        let content = all
            .iter()
            .map(|pid| pid.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        fs::write(&self.pid_file, content + "\n")
            .with_context(|| format!("failed to write {}", self.pid_file.display()))?;
        Ok(())
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).context("failed to signal process")?;
    Ok(())
}

#[cfg(windows)]
fn terminate(pid: u32) -> Result<()> {
    Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .status()
        .context("failed to signal process")?;
    Ok(())
}

#[cfg(unix)]
fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(windows)]
fn is_alive(_pid: u32) -> bool {
    true
}
