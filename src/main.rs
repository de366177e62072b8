#![forbid(unsafe_code)]

//! `slack-kernel-relay`: the Slack front-end process.
//!
//! Connects to Slack over Socket Mode, listens on the relay, and keeps a
//! `slack-kernel-manager` child running behind it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use slack_kernel_relay::config::GlobalConfig;
use slack_kernel_relay::frontend::{ChatSink, FrontendSession, KernelManagerProcess};
use slack_kernel_relay::models::identity::Identity;
use slack_kernel_relay::relay::{RelayEndpoint, Role};
use slack_kernel_relay::runtime::{cancel_on_signal, init_tracing, LogFormat};
use slack_kernel_relay::slack::SlackService;
use slack_kernel_relay::{AppError, Result};

#[derive(Debug, Parser)]
#[command(name = "slack-kernel-relay", about = "Slack front-end for a supervised interpreter kernel", version, long_about = None)]
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
    info!("slack-kernel-relay bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    config.load_credentials().await?;
    info!("configuration loaded");

    let ct = CancellationToken::new();
    let _guard = ct.clone().drop_guard();
    cancel_on_signal(ct.clone());

    let endpoint = RelayEndpoint::connect(Identity::FrontEnd, Role::Listener, config.relay_name.clone())?;
    let slack = Arc::new(SlackService::connect(&config.slack)?);
    let manager = KernelManagerProcess::from_config(&config, &args.config)?;
    let sink: Arc<dyn ChatSink> = Arc::clone(&slack) as Arc<dyn ChatSink>;
    let session = Arc::new(FrontendSession::new(
        sink,
        endpoint.sender(),
        manager,
        config.image_cache_dir.clone(),
        config.version_probe.clone(),
    ));

    let socket_task = slack.start_socket_mode(Arc::clone(&session));
    let pid = session.start_kernel_manager().await?;
    info!(pid, "kernel manager launched");

    let served = endpoint.run(session.as_ref(), ct.clone()).await;
    if let Err(err) = &served {
        error!(%err, "relay loop failed");
    }

    match session.stop_kernel_manager().await {
        Ok(report) => info!(?report, "kernel manager stopped"),
        Err(err) => warn!(%err, "kernel manager stop at exit"),
    }
    socket_task.abort();
    info!("front-end shut down");
    served
}
