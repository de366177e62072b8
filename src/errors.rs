//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Slack API or Socket Mode failure.
    Slack(String),
    /// Relay link failure (bind, connect, write).
    Relay(String),
    /// Envelope or frame could not be encoded or decoded.
    Codec(String),
    /// Kernel client or kernel output failure.
    Kernel(String),
    /// A supervised subprocess could not be launched.
    Spawn(String),
    /// A stop was requested but no supervised process is running.
    NotRunning(String),
    /// A start was requested while a supervised process is still alive.
    AlreadyRunning(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Slack(msg) => write!(f, "slack: {msg}"),
            Self::Relay(msg) => write!(f, "relay: {msg}"),
            Self::Codec(msg) => write!(f, "codec: {msg}"),
            Self::Kernel(msg) => write!(f, "kernel: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::NotRunning(msg) => write!(f, "not running: {msg}"),
            Self::AlreadyRunning(msg) => write!(f, "already running: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
