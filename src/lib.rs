#![forbid(unsafe_code)]

//! Chat-to-kernel relay: a Slack front-end and a kernel-manager process
//! joined by a local-socket relay.

pub mod config;
pub mod errors;
pub mod frontend;
pub mod kernel;
pub mod models;
pub mod relay;
pub mod runtime;
pub mod slack;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
