//! The kernel-manager child process, as seen from the front-end.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::kernel::pid_registry::{CleanupReport, PidRegistry};
use crate::{AppError, Result};

/// Default binary name of the kernel-manager.
pub const MANAGER_BINARY: &str = "slack-kernel-manager";

/// Owner of at most one kernel-manager child.
#[derive(Debug)]
pub struct KernelManagerProcess {
    program: PathBuf,
    args: Vec<OsString>,
    registry: PidRegistry,
    grace: Duration,
    child: Mutex<Option<Child>>,
}

impl KernelManagerProcess {
    /// Manager launched as `program args..`; `pid_dir` is swept on stop.
    #[must_use]
    pub fn new(
        program: impl Into<PathBuf>,
        args: Vec<OsString>,
        pid_dir: impl Into<PathBuf>,
        grace: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            registry: PidRegistry::new(pid_dir),
            grace,
            child: Mutex::new(None),
        }
    }

    /// Manager configured from `config`, passing `config_path` on.
    ///
    /// Without `manager.program` the binary next to the running executable
    /// is used.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the running executable cannot be
    /// located.
    pub fn from_config(config: &GlobalConfig, config_path: &Path) -> Result<Self> {
        let program = match &config.manager.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()
                .map_err(|err| AppError::Config(format!("cannot locate executable: {err}")))?
                .with_file_name(format!("{MANAGER_BINARY}{}", std::env::consts::EXE_SUFFIX)),
        };
        let mut args: Vec<OsString> = config.manager.args.iter().map(OsString::from).collect();
        args.push("--config".into());
        args.push(config_path.as_os_str().to_owned());
        Ok(Self::new(
            program,
            args,
            config.kernel.pid_dir.clone(),
            Duration::from_secs(config.manager.stop_grace_seconds),
        ))
    }

    /// Whether a child is alive.
    pub async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        matches!(guard.as_mut().map(Child::try_wait), Some(Ok(None)))
    }

    /// Spawn the kernel-manager.
    ///
    /// # Errors
    ///
    /// - `AppError::AlreadyRunning` if a live child exists.
    /// - `AppError::Spawn` if the program cannot be executed.
    pub async fn start(&self) -> Result<u32> {
        let mut slot = self.child.lock().await;
        self.start_locked(&mut slot)
    }

    /// Terminate the kernel-manager and sweep recorded kernels.
    ///
    /// The child gets the grace period to shut its kernel down before it
    /// is killed. The child slot stays locked until the sweep is done, so
    /// a concurrent start cannot record a kernel the sweep would kill.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotRunning` when there is no child to stop.
    pub async fn stop(&self) -> Result<CleanupReport> {
        let mut slot = self.child.lock().await;
        self.stop_locked(&mut slot).await
    }

    /// Stop the current child, if any, and start a new one as one step.
    ///
    /// Concurrent restarts run one after the other; each leaves exactly one
    /// live child behind.
    ///
    /// # Errors
    ///
    /// - `AppError::Spawn` if the program cannot be executed.
    /// - `AppError::Io` if the pid sweep cannot run.
    pub async fn restart(&self) -> Result<u32> {
        let mut slot = self.child.lock().await;
        match self.stop_locked(&mut slot).await {
            Ok(report) => debug!(?report, "kernel manager stopped for restart"),
            Err(AppError::NotRunning(_)) => info!("no kernel manager to stop; starting fresh"),
            Err(err) => return Err(err),
        }
        self.start_locked(&mut slot)
    }

    fn start_locked(&self, slot: &mut Option<Child>) -> Result<u32> {
        if let Some(child) = slot.as_mut() {
            if let Ok(None) = child.try_wait() {
                return Err(AppError::AlreadyRunning(
                    "kernel manager is already running".into(),
                ));
            }
        }

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                AppError::Spawn(format!(
                    "failed to spawn kernel manager '{}': {err}",
                    self.program.display()
                ))
            })?;
        let pid = child.id().unwrap_or(0);
        info!(pid, program = %self.program.display(), "kernel manager started");
        *slot = Some(child);
        Ok(pid)
    }

    async fn stop_locked(&self, slot: &mut Option<Child>) -> Result<CleanupReport> {
        let Some(mut child) = slot.take() else {
            return Err(AppError::NotRunning("no active kernel manager".into()));
        };

        terminate(&child);
        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "kernel manager exited"),
            Ok(Err(err)) => warn!(%err, "failed to wait for kernel manager"),
            Err(_elapsed) => {
                warn!(grace = ?self.grace, "kernel manager ignored termination; killing");
                if let Err(err) = child.kill().await {
                    warn!(%err, "failed to kill kernel manager");
                }
            }
        }

        let registry = self.registry.clone();
        let report = tokio::task::spawn_blocking(move || registry.cleanup_kernels())
            .await
            .map_err(|err| AppError::Io(format!("pid sweep task failed: {err}")))?;
        Ok(report)
    }
}

/// Ask the child to shut down cleanly.
#[cfg(unix)]
fn terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(errno) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!(pid, %errno, "failed to signal kernel manager");
    }
}

/// No polite termination on this platform; the grace wait falls through to
/// a kill.
#[cfg(not(unix))]
fn terminate(_child: &Child) {}
