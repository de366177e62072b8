//! Kernel process supervisor.
//!
//! Spawns the kernel launcher with `kill_on_drop(true)`, records its pid in
//! the [`PidRegistry`], waits a bounded number of polls for the connection
//! descriptor, and hands back a ready [`KernelClient`]. Unexpected exits
//! are picked up by [`KernelSupervisor::check_exit`], which the periodic
//! flush activity calls.

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::KernelConfig;
use crate::kernel::client::{ConnectionDescriptor, KernelClient, TcpKernelClient};
use crate::kernel::pid_registry::{CleanupReport, PidRegistry};
use crate::models::lifecycle::KernelState;
use crate::models::process_record::ProcessRecord;
use crate::{AppError, Result};

/// Owner of at most one kernel subprocess.
#[derive(Debug)]
pub struct KernelSupervisor {
    config: KernelConfig,
    registry: PidRegistry,
    child: Option<Child>,
    pid: Option<u32>,
    state: KernelState,
}

impl KernelSupervisor {
    /// Supervisor for kernels launched per `config`.
    #[must_use]
    pub fn new(config: KernelConfig) -> Self {
        let registry = PidRegistry::new(config.pid_dir.clone());
        Self {
            config,
            registry,
            child: None,
            pid: None,
            state: KernelState::NotStarted,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> KernelState {
        self.state
    }

    /// Pid of the current kernel, if one is running.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Pid tracking registry.
    #[must_use]
    pub fn registry(&self) -> &PidRegistry {
        &self.registry
    }

    fn transition(&mut self, next: KernelState) {
        if self.state.can_transition_to(next) {
            info!(from = %self.state, to = %next, "kernel state change");
            self.state = next;
        } else {
            warn!(from = %self.state, to = %next, "ignoring invalid kernel state change");
        }
    }

    /// Kill kernels recorded by previous runs and delete their records.
    pub fn cleanup_kernels(&self) -> CleanupReport {
        self.registry.cleanup_kernels()
    }

    /// Launch the kernel and return a ready client.
    ///
    /// # Errors
    ///
    /// - `AppError::AlreadyRunning` if this supervisor already launched one.
    /// - `AppError::Spawn` if the launcher cannot be executed.
    /// - `AppError::Kernel` if the descriptor never appears, the kernel
    ///   exits early, or it does not become ready in time.
    pub async fn start_kernel(&mut self) -> Result<Box<dyn KernelClient>> {
        if self.state != KernelState::NotStarted {
            return Err(AppError::AlreadyRunning(format!(
                "kernel supervisor is {}",
                self.state
            )));
        }

        let span = info_span!("start_kernel", command = %self.config.command);
        async {
            let connection_file = self.config.connection_file.clone();
            remove_stale_descriptor(&connection_file)?;

            self.transition(KernelState::Launching);
            let args = self.config.launch_args(&connection_file);
            let child = Command::new(&self.config.command)
                .args(&args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| {
                    self.state = KernelState::Crashed;
                    AppError::Spawn(format!(
                        "failed to spawn kernel '{}': {err}",
                        self.config.command
                    ))
                })?;

            let pid = child.id();
            info!(pid = pid.unwrap_or(0), ?args, "kernel process spawned");
            if let Some(pid) = pid {
                if let Err(err) = self.registry.record(ProcessRecord::new(pid)) {
                    warn!(%err, pid, "failed to record kernel pid");
                }
            }
            self.child = Some(child);
            self.pid = pid;
            self.transition(KernelState::AwaitingConnection);

            match self.connect(&connection_file).await {
                Ok(client) => {
                    self.transition(KernelState::Ready);
                    Ok(client)
                }
                Err(err) => {
                    error!(%err, "kernel failed to come up");
                    self.abandon().await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn connect(&mut self, connection_file: &Path) -> Result<Box<dyn KernelClient>> {
        let descriptor = self.wait_for_descriptor(connection_file).await?;
        let mut client = TcpKernelClient::connect(&descriptor).await?;
        client.wait_for_ready(self.config.ready_timeout()).await?;
        info!("kernel client ready");
        Ok(Box::new(client))
    }

    /// Poll for a parseable descriptor, at most
    /// `descriptor_max_attempts` times. A complete but unusable descriptor
    /// fails at once; a truncated one is read again on the next attempt.
    async fn wait_for_descriptor(&mut self, path: &Path) -> Result<ConnectionDescriptor> {
        let interval = self.config.descriptor_poll_interval();
        let mut seen_incomplete = false;
        for attempt in 1..=self.config.descriptor_max_attempts {
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(AppError::Kernel(format!(
                        "kernel exited before writing its connection file ({status})"
                    )));
                }
            }
            if path.is_file() {
                match ConnectionDescriptor::load(path).await? {
                    Some(descriptor) => return Ok(descriptor),
                    None => {
                        seen_incomplete = true;
                        debug!(attempt, "connection file incomplete");
                    }
                }
            }
            tokio::time::sleep(interval).await;
        }
        let attempts = self.config.descriptor_max_attempts;
        Err(AppError::Kernel(if seen_incomplete {
            format!(
                "connection file {} still incomplete after {attempts} attempts",
                path.display()
            )
        } else {
            format!(
                "connection file {} not written after {attempts} attempts",
                path.display()
            )
        }))
    }

    /// Tear down a kernel that failed during startup.
    async fn abandon(&mut self) {
        self.kill_child().await;
        self.state = KernelState::Crashed;
    }

    async fn kill_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill().await {
                warn!(%err, "failed to kill kernel process");
            }
        }
        if let Some(pid) = self.pid.take() {
            if let Err(err) = self.registry.forget(ProcessRecord::new(pid)) {
                warn!(%err, pid, "failed to remove kernel pid record");
            }
        }
    }

    /// Note that the dispatch loop has started serving relay traffic.
    pub fn mark_serving(&mut self) {
        self.transition(KernelState::Serving);
    }

    /// Detect an unexpected kernel exit.
    ///
    /// Returns a description of the exit the first time it is observed;
    /// the state moves to [`KernelState::Crashed`] and the pid record is
    /// removed.
    pub fn check_exit(&mut self) -> Option<String> {
        let child = self.child.as_mut()?;
        let description = match child.try_wait() {
            Ok(Some(status)) => status.code().map_or_else(
                || "kernel terminated by signal".to_owned(),
                |code| format!("kernel exited with code {code}"),
            ),
            Ok(None) => return None,
            Err(err) => format!("kernel status unknown: {err}"),
        };

        self.child = None;
        if let Some(pid) = self.pid.take() {
            if let Err(err) = self.registry.forget(ProcessRecord::new(pid)) {
                warn!(%err, pid, "failed to remove kernel pid record");
            }
        }
        if self.state != KernelState::Stopping {
            self.transition(KernelState::Crashed);
        }
        warn!(status = %description, "kernel process exited");
        Some(description)
    }

    /// Kill the current kernel and sweep the pid registry.
    pub async fn stop(&mut self) {
        let span = info_span!("stop_kernel", pid = self.pid.unwrap_or(0));
        async {
            if !self.state.is_terminal() {
                self.transition(KernelState::Stopping);
            }
            self.kill_child().await;
            let report = self.cleanup_kernels();
            if !report.killed.is_empty() || !report.failed.is_empty() {
                info!(?report, "pid sweep after stop");
            }
            if self.state == KernelState::Stopping {
                self.transition(KernelState::Stopped);
            }
        }
        .instrument(span)
        .await;
    }
}

/// Remove a connection descriptor left behind by an earlier kernel.
///
/// # Errors
///
/// Returns `AppError::Io` if the stale entry exists but cannot be removed.
pub fn remove_stale_descriptor(path: &Path) -> Result<()> {
    let removed = if path.is_file() {
        std::fs::remove_file(path)
    } else if path.is_dir() {
        std::fs::remove_dir(path)
    } else {
        return Ok(());
    };
    removed.map_err(|err| {
        AppError::Io(format!(
            "failed to remove stale connection file {}: {err}",
            path.display()
        ))
    })?;
    info!(path = %path.display(), "removed stale connection file");
    Ok(())
}
