#![forbid(unsafe_code)]

//! `slack-kernel-manager`: owns the interpreter kernel.
//!
//! Spawned by `slack-kernel-relay`; connects back over the relay and
//! serves `execute`, `flush` and `status` requests until terminated.

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use slack_kernel_relay::config::GlobalConfig;
use slack_kernel_relay::kernel::run_manager;
use slack_kernel_relay::runtime::{cancel_on_signal, init_tracing, LogFormat};
use slack_kernel_relay::{AppError, Result};

#[derive(Debug, Parser)]
#[command(name = "slack-kernel-manager", about = "Interpreter kernel supervisor", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("slack-kernel-manager bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = GlobalConfig::load_from_path(&args.config)?;
    let ct = CancellationToken::new();
    cancel_on_signal(ct.clone());

    let result = run_manager(config, ct).await;
    if let Err(err) = &result {
        error!(%err, "kernel manager exited with error");
    }
    result
}
