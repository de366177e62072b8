//! Front-end session: the channel set, chat fan-out, and the
//! kernel-manager child.
//!
//! Every channel that has ever messaged the bot receives every kernel
//! output. A per-channel kernel routing table would slot in here.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::frontend::commands::{generate_help, strip_autolinks, AdminCommand};
use crate::frontend::manager_process::KernelManagerProcess;
use crate::frontend::sink::ChatSink;
use crate::kernel::pid_registry::CleanupReport;
use crate::models::envelope::{Envelope, EnvelopeKind, STATUS_DEAD, STATUS_READY};
use crate::models::identity::Identity;
use crate::relay::{RelayHandler, RelaySender};
use crate::{AppError, Result};

/// Notice broadcast once the kernel answers.
pub const READY_NOTICE: &str = "Kernel is ready.";
/// Notice broadcast when the kernel dies under the manager.
pub const DEAD_NOTICE: &str = "Kernel exited unexpectedly. Use `.kernel restart` to start a new one.";
/// Reply sent before a restart begins.
pub const RESTART_NOTICE: &str = "Restarting kernel...";

/// Front-end state shared by the chat listener and the relay loop.
pub struct FrontendSession {
    channels: Mutex<BTreeSet<String>>,
    sink: Arc<dyn ChatSink>,
    relay: RelaySender,
    manager: KernelManagerProcess,
    image_dir: PathBuf,
    version_probe: String,
}

impl FrontendSession {
    /// Session posting through `sink` and sending through `relay`.
    #[must_use]
    pub fn new(
        sink: Arc<dyn ChatSink>,
        relay: RelaySender,
        manager: KernelManagerProcess,
        image_dir: impl Into<PathBuf>,
        version_probe: impl Into<String>,
    ) -> Self {
        Self {
            channels: Mutex::new(BTreeSet::new()),
            sink,
            relay,
            manager,
            image_dir: image_dir.into(),
            version_probe: version_probe.into(),
        }
    }

    /// Channels that have messaged the bot, in sorted order.
    pub async fn channels(&self) -> Vec<String> {
        self.channels.lock().await.iter().cloned().collect()
    }

    /// The kernel-manager child.
    #[must_use]
    pub fn manager(&self) -> &KernelManagerProcess {
        &self.manager
    }

    /// Handle one inbound chat message.
    pub async fn on_chat_message(&self, channel: &str, text: &str) {
        let inserted = self.channels.lock().await.insert(channel.to_owned());
        if inserted {
            info!(channel, "new channel registered");
        }

        let Some(command) = AdminCommand::parse(text) else {
            let code = strip_autolinks(text);
            debug!(channel, len = code.len(), "forwarding chat message to kernel");
            self.relay.send(Envelope::execute(code), Identity::KernelManager);
            return;
        };

        info!(channel, ?command, "admin command");
        match command {
            AdminCommand::Restart => {
                self.reply(channel, RESTART_NOTICE).await;
                if let Err(err) = self.restart_kernel_manager().await {
                    warn!(%err, "kernel manager restart failed");
                    self.reply(channel, &format!("Kernel restart failed: {err}")).await;
                }
            }
            AdminCommand::Version => self
                .relay
                .send(Envelope::execute(self.version_probe.clone()), Identity::KernelManager),
            AdminCommand::Status => self
                .relay
                .send(Envelope::status(None), Identity::KernelManager),
            AdminCommand::Help | AdminCommand::Unknown(_) => {
                self.reply(channel, &generate_help()).await;
            }
        }
    }

    async fn reply(&self, channel: &str, text: &str) {
        if let Err(err) = self.sink.post_text(channel, text).await {
            warn!(channel, %err, "failed to reply");
        }
    }

    /// Spawn the kernel-manager child.
    ///
    /// # Errors
    ///
    /// See [`KernelManagerProcess::start`].
    pub async fn start_kernel_manager(&self) -> Result<u32> {
        self.manager.start().await
    }

    /// Terminate the kernel-manager child and sweep recorded kernels.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotRunning` when there is no child.
    pub async fn stop_kernel_manager(&self) -> Result<CleanupReport> {
        self.manager.stop().await
    }

    async fn restart_kernel_manager(&self) -> Result<()> {
        let pid = self.manager.restart().await?;
        debug!(pid, "kernel manager restarted");
        Ok(())
    }

    /// Deliver `value` to every known channel as `kind`.
    ///
    /// A failure for one channel is logged and the rest still receive it.
    pub async fn broadcast(&self, value: &str, kind: EnvelopeKind) {
        // Snapshot so no lock is held across chat I/O.
        let channels = self.channels().await;
        if channels.is_empty() {
            debug!(kind = kind.as_str(), "no channels to broadcast to");
            return;
        }

        let span = info_span!("broadcast", kind = kind.as_str(), channels = channels.len());
        async {
            match kind {
                EnvelopeKind::Message => {
                    for channel in &channels {
                        if let Err(err) = self.sink.post_text(channel, value).await {
                            warn!(channel, %err, "post failed");
                        }
                    }
                }
                EnvelopeKind::MessageRaw => {
                    for channel in &channels {
                        if let Err(err) = self.sink.post_code_block(channel, value).await {
                            warn!(channel, %err, "code block post failed");
                        }
                    }
                }
                EnvelopeKind::Image => self.broadcast_image(value, &channels).await,
                other => debug!(kind = other.as_str(), "not a broadcastable kind"),
            }
        }
        .instrument(span)
        .await;
    }

    async fn broadcast_image(&self, encoded: &str, channels: &[String]) {
        let image = match write_image(&self.image_dir, encoded) {
            Ok(image) => image,
            Err(err) => {
                warn!(%err, "dropping undecodable image");
                return;
            }
        };

        for channel in channels {
            if let Err(err) = self.sink.upload_file(channel, image.path()).await {
                warn!(channel, %err, "image upload failed");
            }
        }

        let path = image.path().to_owned();
        if let Err(err) = image.close() {
            warn!(path = %path.display(), %err, "failed to remove image temp file");
        }
    }
}

/// Decode a base64 PNG into a fresh temp file under `dir`.
///
/// The file is deleted when the returned handle is dropped or closed.
fn write_image(dir: &Path, encoded: &str) -> Result<tempfile::NamedTempFile> {
    use std::io::Write;

    let compact: String = encoded.split_whitespace().collect();
    let bytes = STANDARD
        .decode(compact)
        .map_err(|err| AppError::Codec(format!("invalid base64 image: {err}")))?;
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::Builder::new()
        .prefix("kernel-")
        .suffix(".png")
        .tempfile_in(dir)?;
    file.write_all(&bytes)?;
    file.flush()?;
    Ok(file)
}

impl RelayHandler for FrontendSession {
    fn on_receive(
        &self,
        from: Identity,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if from != Identity::KernelManager {
                debug!(%from, "ignoring envelope from unexpected sender");
                return;
            }
            let kind = envelope.kind();
            match (kind, envelope.value()) {
                (EnvelopeKind::Status, Some(STATUS_READY)) => {
                    self.broadcast(READY_NOTICE, EnvelopeKind::Message).await;
                }
                (EnvelopeKind::Status, Some(STATUS_DEAD)) => {
                    self.broadcast(DEAD_NOTICE, EnvelopeKind::Message).await;
                }
                (EnvelopeKind::Status, Some(state)) => {
                    let notice = format!("Kernel status: {state}");
                    self.broadcast(&notice, EnvelopeKind::Message).await;
                }
                (
                    EnvelopeKind::Message | EnvelopeKind::MessageRaw | EnvelopeKind::Image,
                    Some(value),
                ) => self.broadcast(value, kind).await,
                _ => debug!(kind = kind.as_str(), "ignoring envelope"),
            }
        })
    }
}
