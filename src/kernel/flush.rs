//! Output flush: drain kernel output and republish it as envelopes.
//!
//! | Kernel event     | Condition                 | Envelope      | Value                 |
//! |------------------|---------------------------|---------------|-----------------------|
//! | `execute_result` | has `text/plain`          | `message_raw` | plain text            |
//! | `display_data`   | has `image/png`           | `image`       | base64 PNG            |
//! | `display_data`   | `text/plain`, no image    | `message`     | plain text            |
//! | `stream`         | always                    | `message`     | stream text           |
//! | `error`          | always                    | `message_raw` | traceback, ANSI-free  |
//!
//! A cycle ends after `max_empty_polls` consecutive empty polls. A decode
//! failure ends the cycle early; whatever is still queued is left for the
//! next cycle.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::FlushConfig;
use crate::kernel::client::SharedKernelClient;
use crate::kernel::supervisor::KernelSupervisor;
use crate::models::envelope::{Envelope, STATUS_DEAD};
use crate::models::kernel_event::{mime_text, KernelEvent, MIME_IMAGE_PNG, MIME_TEXT_PLAIN};
use crate::relay::RelaySender;
use crate::Result;

/// Bounds of one flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSettings {
    /// Consecutive empty polls that end the cycle.
    pub max_empty_polls: u32,
    /// Wait per poll.
    pub poll_timeout: Duration,
}

impl FlushSettings {
    /// Settings of the background flush activity.
    #[must_use]
    pub fn periodic(config: &FlushConfig) -> Self {
        Self {
            max_empty_polls: config.max_empty_polls,
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
        }
    }

    /// Settings of the flush that follows an `execute`.
    #[must_use]
    pub fn post_execute(config: &FlushConfig) -> Self {
        Self {
            max_empty_polls: config.post_execute_max_empty_polls,
            poll_timeout: Duration::from_millis(config.post_execute_poll_timeout_ms),
        }
    }

    /// A single-pass flush, used for explicit `flush` requests.
    #[must_use]
    pub fn single_pass(poll_timeout: Duration) -> Self {
        Self {
            max_empty_polls: 1,
            poll_timeout,
        }
    }
}

/// What one flush cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    /// Events read from the kernel.
    pub events: usize,
    /// Envelopes handed to the relay.
    pub emitted: usize,
    /// Whether a failure cut the cycle short.
    pub ended_early: bool,
}

/// Consecutive-empty-poll counter with a fixed ceiling.
#[derive(Debug)]
struct EmptyPollBudget {
    limit: u32,
    consecutive: u32,
}

impl EmptyPollBudget {
    fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            consecutive: 0,
        }
    }

    /// Count an empty poll; `true` once the ceiling is reached.
    fn record_empty(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.limit
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

#[allow(clippy::unwrap_used)] // literal pattern
fn ansi_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?:\x1B[@-_]|[\x{80}-\x{9F}])[0-?]*[ -/]*[@-~]").unwrap())
}

/// Remove ANSI escape sequences (colours, cursor control) from `text`.
#[must_use]
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").into_owned()
}

/// Translate one kernel event into outbound envelopes.
///
/// # Errors
///
/// Returns `AppError::Kernel` when a rich representation is not text.
pub fn map_event(event: &KernelEvent) -> Result<Vec<Envelope>> {
    let envelopes = match event {
        KernelEvent::ExecuteResult { data } => mime_text(data, MIME_TEXT_PLAIN)?
            .map(Envelope::message_raw)
            .into_iter()
            .collect(),
        KernelEvent::DisplayData { data } => {
            if let Some(image) = mime_text(data, MIME_IMAGE_PNG)? {
                vec![Envelope::image(image.trim_end())]
            } else {
                mime_text(data, MIME_TEXT_PLAIN)?
                    .map(Envelope::message)
                    .into_iter()
                    .collect()
            }
        }
        KernelEvent::Stream { text, .. } => vec![Envelope::message(text.clone())],
        KernelEvent::Error { traceback, .. } => {
            vec![Envelope::message_raw(strip_ansi(&traceback.join("\n")))]
        }
        KernelEvent::Status { .. } | KernelEvent::Other { .. } => Vec::new(),
    };
    Ok(envelopes)
}

/// Drain kernel output until the empty-poll ceiling or a failure.
///
/// The client lock is taken for one poll at a time so other users of the
/// client are never starved for a whole cycle.
pub async fn flush(
    client: &SharedKernelClient,
    relay: &RelaySender,
    settings: FlushSettings,
) -> FlushSummary {
    let recipient = relay.identity().peer();
    let mut budget = EmptyPollBudget::new(settings.max_empty_polls);
    let mut summary = FlushSummary::default();

    loop {
        let polled = {
            let mut guard = client.lock().await;
            guard.next_output(settings.poll_timeout).await
        };
        match polled {
            Ok(Some(event)) => {
                budget.reset();
                summary.events += 1;
                match map_event(&event) {
                    Ok(envelopes) => {
                        for envelope in envelopes {
                            relay.send(envelope, recipient);
                            summary.emitted += 1;
                        }
                    }
                    Err(err) => {
                        warn!(%err, "undecodable kernel event; ending flush cycle");
                        summary.ended_early = true;
                        break;
                    }
                }
            }
            Ok(None) => {
                if budget.record_empty() {
                    break;
                }
            }
            Err(err) => {
                warn!(%err, "kernel output poll failed; ending flush cycle");
                summary.ended_early = true;
                break;
            }
        }
    }

    if summary.events > 0 {
        debug!(?summary, "flush cycle complete");
    }
    summary
}

/// Spawn the periodic flush activity.
///
/// Each iteration first checks `ct`, then whether the kernel has exited;
/// an exit is reported once as a `dead` status and ends the activity.
#[must_use]
pub fn spawn_flush_loop(
    client: SharedKernelClient,
    supervisor: Arc<Mutex<KernelSupervisor>>,
    relay: RelaySender,
    config: &FlushConfig,
    ct: CancellationToken,
) -> JoinHandle<()> {
    let settings = FlushSettings::periodic(config);
    let interval = config.interval();
    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("flush loop shutting down");
                        break;
                    }
                    () = tokio::time::sleep(interval) => {}
                }

                let exited = supervisor.lock().await.check_exit();
                if let Some(description) = exited {
                    warn!(status = %description, "kernel gone; stopping flush loop");
                    relay.send(
                        Envelope::status(Some(STATUS_DEAD.to_owned())),
                        relay.identity().peer(),
                    );
                    break;
                }

                flush(&client, &relay, settings).await;
            }
        }
        .instrument(info_span!("flush_loop")),
    )
}
