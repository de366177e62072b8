//! Kernel-manager service: owns the kernel and answers the front-end.
//!
//! Startup order is fixed: sweep stale kernels, start a fresh kernel,
//! connect the relay as [`Identity::KernelManager`], announce `ready`,
//! start the background flush, then serve relay traffic until cancelled.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{FlushConfig, GlobalConfig};
use crate::kernel::client::{shared, SharedKernelClient};
use crate::kernel::flush::{flush, spawn_flush_loop, FlushSettings};
use crate::kernel::supervisor::KernelSupervisor;
use crate::models::envelope::{Envelope, EnvelopeKind, STATUS_READY};
use crate::models::identity::Identity;
use crate::relay::{RelayEndpoint, RelayHandler, RelaySender, Role};
use crate::Result;

/// Relay handler of the kernel-manager process.
pub struct KernelManagerHandler {
    client: SharedKernelClient,
    supervisor: Arc<Mutex<KernelSupervisor>>,
    relay: RelaySender,
    flush_config: FlushConfig,
}

impl KernelManagerHandler {
    /// Handler driving `client` and replying through `relay`.
    #[must_use]
    pub fn new(
        client: SharedKernelClient,
        supervisor: Arc<Mutex<KernelSupervisor>>,
        relay: RelaySender,
        flush_config: FlushConfig,
    ) -> Self {
        Self {
            client,
            supervisor,
            relay,
            flush_config,
        }
    }

    /// Submit `code`, then run a short flush so fast results go out at once.
    async fn execute(&self, code: &str) {
        let submitted = {
            let mut guard = self.client.lock().await;
            guard.execute(code).await
        };
        if let Err(err) = submitted {
            warn!(%err, "kernel rejected execute request");
            return;
        }
        flush(
            &self.client,
            &self.relay,
            FlushSettings::post_execute(&self.flush_config),
        )
        .await;
    }

    async fn report_status(&self) {
        let state = self.supervisor.lock().await.state();
        self.relay.send(
            Envelope::status(Some(state.as_str().to_owned())),
            Identity::FrontEnd,
        );
    }
}

impl RelayHandler for KernelManagerHandler {
    fn on_receive(
        &self,
        from: Identity,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if from != Identity::FrontEnd {
                debug!(%from, "ignoring envelope from unexpected sender");
                return;
            }
            match envelope.kind() {
                EnvelopeKind::Execute => {
                    if let Some(code) = envelope.value() {
                        self.execute(code).await;
                    }
                }
                EnvelopeKind::Flush => {
                    let settings = FlushSettings::single_pass(
                        FlushSettings::periodic(&self.flush_config).poll_timeout,
                    );
                    flush(&self.client, &self.relay, settings).await;
                }
                EnvelopeKind::Status => self.report_status().await,
                other => debug!(kind = other.as_str(), "ignoring envelope"),
            }
        })
    }
}

/// Run the kernel-manager until `ct` is cancelled or the relay fails.
///
/// # Errors
///
/// Returns the kernel startup failure (the relay loop is never entered) or
/// a relay error.
pub async fn run_manager(config: GlobalConfig, ct: CancellationToken) -> Result<()> {
    // Anything spawned below observes cancellation on every exit path.
    let _guard = ct.clone().drop_guard();

    let mut supervisor = KernelSupervisor::new(config.kernel.clone());
    let report = supervisor.cleanup_kernels();
    info!(
        killed = report.killed.len(),
        failed = report.failed.len(),
        "startup pid sweep complete"
    );

    let client = shared(supervisor.start_kernel().await?);

    let endpoint = RelayEndpoint::connect(
        Identity::KernelManager,
        Role::Connector,
        config.relay_name.clone(),
    )?;
    let relay = endpoint.sender();
    relay.send(
        Envelope::status(Some(STATUS_READY.to_owned())),
        Identity::FrontEnd,
    );

    supervisor.mark_serving();
    let supervisor = Arc::new(Mutex::new(supervisor));

    let flush_ct = ct.child_token();
    let flush_task = spawn_flush_loop(
        Arc::clone(&client),
        Arc::clone(&supervisor),
        relay.clone(),
        &config.flush,
        flush_ct.clone(),
    );

    let handler = KernelManagerHandler::new(
        client,
        Arc::clone(&supervisor),
        relay,
        config.flush.clone(),
    );
    let served = endpoint
        .run(&handler, ct.clone())
        .instrument(info_span!("kernel_manager_relay"))
        .await;

    flush_ct.cancel();
    if let Err(err) = flush_task.await {
        warn!(%err, "flush loop task failed");
    }
    supervisor.lock().await.stop().await;
    info!("kernel manager stopped");
    served
}
