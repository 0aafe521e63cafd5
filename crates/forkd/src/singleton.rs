//! Single-instance enforcement through a shared PID record.
//!
//! The record is a plain file with one PID per line. It is only used to
//! detect other daemons, never as a lock:
//! - every recorded PID is checked for liveness, so a PID left behind by a
//!   crashed daemon is ignored rather than treated as a holder
//! - if any *other* live PID is recorded, this process must stop serving
//! - otherwise the record is rewritten to hold only this process's PID
//! - on clean shutdown only this process's own PID is removed

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::atomic::write_atomic;

/// How often a running daemon re-checks the PID record.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Errors reading or writing the PID record.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("PID record {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Outcome of a guard check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardStatus {
    /// No other live daemon is recorded; our PID is in the record.
    Sole,
    /// Another live daemon is recorded and wins.
    Superseded { holder: u32 },
}

/// Guard over the PID record for one process.
#[derive(Debug, Clone)]
pub struct SingletonGuard {
    path: PathBuf,
    pid: u32,
}

impl SingletonGuard {
    /// Creates a guard for an explicit PID.
    pub fn new(path: impl Into<PathBuf>, pid: u32) -> Self {
        Self {
            path: path.into(),
            pid,
        }
    }

    /// Creates a guard for the current process.
    pub fn for_current_process(path: impl Into<PathBuf>) -> Self {
        Self::new(path, process::id())
    }

    /// PID this guard represents.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Path of the PID record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every parseable PID in the record. A missing file is empty.
    pub fn read_record(&self) -> Result<Vec<u32>, GuardError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(source)),
        };

        Ok(contents
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .filter(|pid| *pid != 0)
            .collect())
    }

    /// Returns recorded PIDs, other than ours, whose process is alive.
    pub fn live_holders(&self) -> Result<Vec<u32>, GuardError> {
        Ok(self
            .read_record()?
            .into_iter()
            .filter(|pid| *pid != self.pid && is_process_alive(*pid))
            .collect())
    }

    /// Reconciles the record.
    ///
    /// Returns `Superseded` if another live daemon is recorded. Otherwise
    /// the record is rewritten to hold only our PID, dropping entries left
    /// behind by dead processes, and `Sole` is returned.
    pub fn check(&self) -> Result<GuardStatus, GuardError> {
        let record = self.read_record()?;

        if let Some(holder) = record
            .iter()
            .copied()
            .find(|pid| *pid != self.pid && is_process_alive(*pid))
        {
            return Ok(GuardStatus::Superseded { holder });
        }

        if record != [self.pid] {
            write_atomic(&self.path, format!("{}\n", self.pid).as_bytes())
                .map_err(|source| self.io_error(source))?;
            debug!(
                pid = self.pid,
                dropped = record.iter().filter(|pid| **pid != self.pid).count(),
                path = %self.path.display(),
                "Recorded daemon PID"
            );
        }

        Ok(GuardStatus::Sole)
    }

    /// Removes our PID from the record, keeping every other line.
    ///
    /// The file is deleted when nothing else remains.
    pub fn release(&self) -> Result<(), GuardError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(self.io_error(source)),
        };

        let own = self.pid.to_string();
        let remaining: Vec<&str> = contents
            .lines()
            .filter(|line| !line.trim().is_empty() && line.trim() != own)
            .collect();

        if remaining.is_empty() {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(self.io_error(source)),
            }
        } else {
            let mut out = remaining.join("\n");
            out.push('\n');
            write_atomic(&self.path, out.as_bytes()).map_err(|source| self.io_error(source))?;
        }

        debug!(pid = self.pid, "Released PID record entry");
        Ok(())
    }

    fn io_error(&self, source: io::Error) -> GuardError {
        GuardError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Checks if a process with the given PID exists.
///
/// Uses `kill(pid, 0)`; a permission error still means the process exists.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    // SAFETY: signal 0 performs permission and existence checks only.
    let result = unsafe { libc::kill(raw, 0) };
    if result == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Spawns the periodic guard check.
///
/// When another live daemon is detected the token is cancelled, which
/// stops every daemon loop and the server, and the task resolves to
/// `Superseded`. It resolves to `Sole` when stopped by the token. A failed
/// check is logged and retried on the next tick.
pub fn spawn_guard_task(
    guard: Arc<SingletonGuard>,
    cancel_token: CancellationToken,
) -> JoinHandle<GuardStatus> {
    tokio::spawn(async move {
        let mut ticker = interval(CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Singleton guard stopping");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let check = {
                let guard = Arc::clone(&guard);
                tokio::task::spawn_blocking(move || guard.check()).await
            };

            match check {
                Ok(Ok(GuardStatus::Sole)) => {}
                Ok(Ok(GuardStatus::Superseded { holder })) => {
                    error!(
                        pid = guard.pid(),
                        holder,
                        "Another live daemon holds the PID record, shutting down"
                    );
                    cancel_token.cancel();
                    return GuardStatus::Superseded { holder };
                }
                Ok(Err(e)) => warn!(error = %e, "Singleton check failed"),
                Err(e) => warn!(error = %e, "Singleton check task failed"),
            }
        }

        info!("Singleton guard stopped");
        GuardStatus::Sole
    })
}
