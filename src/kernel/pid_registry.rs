//! On-disk registry of live kernel pids.
//!
//! One file per kernel, named after its pid, lets a later run find and
//! kill kernels orphaned by a crash. The sweep never aborts on a single
//! bad record: failures are logged and the record is removed anyway.

use std::path::{Path, PathBuf};

use tracing::{info, info_span, warn};

use crate::models::process_record::{ProcessRecord, KERNEL_MARKER};
use crate::{AppError, Result};

/// Outcome of a [`PidRegistry::cleanup_kernels`] sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Records whose pid received a kill signal.
    pub killed: Vec<u32>,
    /// Records whose kill failed (already gone, not permitted).
    pub failed: Vec<u32>,
    /// Record files deleted.
    pub removed: usize,
}

/// Directory-backed set of [`ProcessRecord`]s.
#[derive(Debug, Clone)]
pub struct PidRegistry {
    dir: PathBuf,
}

impl PidRegistry {
    /// Registry rooted at `dir`; the directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Tracking directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a record for a freshly spawned kernel.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory or file cannot be written.
    pub fn record(&self, record: ProcessRecord) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir).map_err(|err| {
            AppError::Io(format!(
                "failed to create pid dir {}: {err}",
                self.dir.display()
            ))
        })?;
        let path = self.dir.join(record.file_name());
        std::fs::write(&path, KERNEL_MARKER).map_err(|err| {
            AppError::Io(format!("failed to write pid record {}: {err}", path.display()))
        })?;
        Ok(path)
    }

    /// Remove the record for `record`, if present.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if an existing file cannot be deleted.
    pub fn forget(&self, record: ProcessRecord) -> Result<()> {
        let path = self.dir.join(record.file_name());
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::Io(format!(
                "failed to remove pid record {}: {err}",
                path.display()
            ))),
        }
    }

    /// Records currently on disk, sorted by pid. Files whose name is not a
    /// pid are skipped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory exists but cannot be read.
    pub fn list(&self) -> Result<Vec<ProcessRecord>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(AppError::Io(format!(
                    "failed to read pid dir {}: {err}",
                    self.dir.display()
                )))
            }
        };

        let mut records: Vec<ProcessRecord> = entries
            .filter_map(std::result::Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                let parsed = name.to_str().and_then(ProcessRecord::from_file_name);
                if parsed.is_none() {
                    warn!(file = ?name, "ignoring non-pid entry in pid dir");
                }
                parsed
            })
            .collect();
        records.sort_unstable();
        Ok(records)
    }

    /// Kill every recorded kernel and delete its record.
    ///
    /// A pid that is already dead, or that cannot be signalled, is logged
    /// and skipped; its record is still removed. Running the sweep on an
    /// empty or missing directory is a no-op.
    pub fn cleanup_kernels(&self) -> CleanupReport {
        let _span = info_span!("cleanup_kernels", dir = %self.dir.display()).entered();
        let mut report = CleanupReport::default();

        let records = match self.list() {
            Ok(records) => records,
            Err(err) => {
                warn!(%err, "pid sweep skipped");
                return report;
            }
        };

        for record in records {
            match kill_pid(record.pid) {
                Ok(()) => {
                    info!(pid = record.pid, "killed stale kernel process");
                    report.killed.push(record.pid);
                }
                Err(err) => {
                    warn!(pid = record.pid, %err, "could not kill recorded kernel process");
                    report.failed.push(record.pid);
                }
            }
            match self.forget(record) {
                Ok(()) => report.removed += 1,
                Err(err) => warn!(pid = record.pid, %err, "could not remove pid record"),
            }
        }

        report
    }
}

/// Forcefully kill `pid`.
#[cfg(unix)]
fn kill_pid(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| AppError::Kernel(format!("pid out of range: {pid}")))?;
    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .map_err(|errno| AppError::Kernel(format!("kill {pid} failed: {errno}")))
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) -> Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .status()
        .map_err(|err| AppError::Kernel(format!("taskkill {pid} failed: {err}")))?;
    if status.success() {
        Ok(())
    } else {
        Err(AppError::Kernel(format!("taskkill {pid} exited with {status}")))
    }
}
