//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Keychain service under which Slack tokens are stored.
const KEYRING_SERVICE: &str = "slack-kernel-relay";

/// Placeholder in `kernel.args` replaced by the connection descriptor path.
pub const CONNECTION_FILE_PLACEHOLDER: &str = "{connection_file}";

/// Slack credentials for Socket Mode connectivity.
///
/// Tokens are loaded at runtime via OS keychain or environment variables,
/// never from the TOML config file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SlackConfig {
    /// App-level token used for Socket Mode (populated at runtime).
    #[serde(skip)]
    pub app_token: String,
    /// Bot user token used for posting messages (populated at runtime).
    #[serde(skip)]
    pub bot_token: String,
}

/// How the kernel subprocess is launched and tracked.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct KernelConfig {
    /// Kernel launcher executable. Required: it must start a kernel that
    /// writes a `{transport, ip, port}` descriptor and speaks
    /// newline-delimited JSON.
    #[serde(default)]
    pub command: String,
    /// Launcher arguments; `{connection_file}` is substituted.
    #[serde(default = "default_kernel_args")]
    pub args: Vec<String>,
    /// Connection descriptor written by the kernel on startup.
    #[serde(default = "default_connection_file")]
    pub connection_file: PathBuf,
    /// Directory holding one record file per live kernel pid.
    #[serde(default = "default_pid_dir")]
    pub pid_dir: PathBuf,
    /// Sleep between checks for the connection descriptor.
    #[serde(default = "default_descriptor_poll_ms")]
    pub descriptor_poll_ms: u64,
    /// Checks before the descriptor wait is declared failed.
    #[serde(default = "default_descriptor_max_attempts")]
    pub descriptor_max_attempts: u32,
    /// Time allowed for the kernel to answer the readiness probe.
    #[serde(default = "default_ready_timeout_seconds")]
    pub ready_timeout_seconds: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: default_kernel_args(),
            connection_file: default_connection_file(),
            pid_dir: default_pid_dir(),
            descriptor_poll_ms: default_descriptor_poll_ms(),
            descriptor_max_attempts: default_descriptor_max_attempts(),
            ready_timeout_seconds: default_ready_timeout_seconds(),
        }
    }
}

impl KernelConfig {
    /// Launcher arguments with the descriptor path filled in.
    ///
    /// The path is appended when no argument carries the placeholder.
    #[must_use]
    pub fn launch_args(&self, connection_file: &Path) -> Vec<String> {
        let path = connection_file.to_string_lossy();
        let mut substituted = false;
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                if arg.contains(CONNECTION_FILE_PLACEHOLDER) {
                    substituted = true;
                    arg.replace(CONNECTION_FILE_PLACEHOLDER, &path)
                } else {
                    arg.clone()
                }
            })
            .collect();
        if !substituted {
            args.push(path.into_owned());
        }
        args
    }

    /// Interval between descriptor checks.
    #[must_use]
    pub fn descriptor_poll_interval(&self) -> Duration {
        Duration::from_millis(self.descriptor_poll_ms)
    }

    /// Readiness probe timeout.
    #[must_use]
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_seconds)
    }
}

fn default_kernel_args() -> Vec<String> {
    vec![CONNECTION_FILE_PLACEHOLDER.into()]
}

fn default_connection_file() -> PathBuf {
    PathBuf::from("kernel-connection.json")
}

fn default_pid_dir() -> PathBuf {
    PathBuf::from("process_pids")
}

fn default_descriptor_poll_ms() -> u64 {
    100
}

fn default_descriptor_max_attempts() -> u32 {
    600
}

fn default_ready_timeout_seconds() -> u64 {
    60
}

/// Output flush cadence and poll bounds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct FlushConfig {
    /// Period of the background flush activity.
    #[serde(default = "default_flush_interval_ms")]
    pub interval_ms: u64,
    /// Per-poll timeout of the background flush.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Consecutive empty polls that end a background flush cycle.
    #[serde(default = "default_max_empty_polls")]
    pub max_empty_polls: u32,
    /// Per-poll timeout of the flush that follows an `execute`.
    #[serde(default = "default_poll_timeout_ms")]
    pub post_execute_poll_timeout_ms: u64,
    /// Empty polls allowed in the flush that follows an `execute`.
    #[serde(default = "default_post_execute_max_empty_polls")]
    pub post_execute_max_empty_polls: u32,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_flush_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_empty_polls: default_max_empty_polls(),
            post_execute_poll_timeout_ms: default_poll_timeout_ms(),
            post_execute_max_empty_polls: default_post_execute_max_empty_polls(),
        }
    }
}

impl FlushConfig {
    /// Period of the background flush activity.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_poll_timeout_ms() -> u64 {
    200
}

fn default_max_empty_polls() -> u32 {
    5
}

fn default_post_execute_max_empty_polls() -> u32 {
    1
}

/// How the front-end launches the kernel-manager child.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ManagerConfig {
    /// Kernel-manager executable; defaults to the sibling binary.
    #[serde(default)]
    pub program: Option<PathBuf>,
    /// Extra arguments placed before `--config`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Grace period between SIGTERM and a hard kill.
    #[serde(default = "default_stop_grace_seconds")]
    pub stop_grace_seconds: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            stop_grace_seconds: default_stop_grace_seconds(),
        }
    }
}

fn default_stop_grace_seconds() -> u64 {
    5
}

fn default_relay_name() -> String {
    "slack-kernel-relay".into()
}

fn default_image_cache_dir() -> PathBuf {
    PathBuf::from("image_cache")
}

fn default_version_probe() -> String {
    "!python --version".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Local socket name shared by both relay endpoints.
    #[serde(default = "default_relay_name")]
    pub relay_name: String,
    /// Scratch directory for decoded images awaiting upload.
    #[serde(default = "default_image_cache_dir")]
    pub image_cache_dir: PathBuf,
    /// Code sent to the kernel for `.kernel version`.
    #[serde(default = "default_version_probe")]
    pub version_probe: String,
    /// Slack connectivity settings.
    #[serde(default)]
    pub slack: SlackConfig,
    /// Kernel launch settings.
    #[serde(default)]
    pub kernel: KernelConfig,
    /// Output flush settings.
    #[serde(default)]
    pub flush: FlushConfig,
    /// Kernel-manager child settings.
    #[serde(default)]
    pub manager: ManagerConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load Slack credentials from OS keychain with env-var fallback.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither keychain nor env vars provide
    /// the required tokens.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.slack.app_token = load_credential("slack_app_token", "SLACK_APP_TOKEN").await?;
        self.slack.bot_token = load_credential("slack_bot_token", "SLACK_BOT_TOKEN").await?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.relay_name.trim().is_empty() {
            return Err(AppError::Config("relay_name must not be empty".into()));
        }
        if self.kernel.command.trim().is_empty() {
            return Err(AppError::Config(
                "kernel.command must name the kernel launcher".into(),
            ));
        }
        if self.kernel.descriptor_max_attempts == 0 {
            return Err(AppError::Config(
                "kernel.descriptor_max_attempts must be greater than zero".into(),
            ));
        }
        if self.flush.max_empty_polls == 0 || self.flush.post_execute_max_empty_polls == 0 {
            return Err(AppError::Config(
                "flush empty-poll ceilings must be greater than zero".into(),
            ));
        }
        if self.flush.interval_ms == 0 {
            return Err(AppError::Config(
                "flush.interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    env::var(env_key).map_err(|_| {
        AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))
    })
}
