//! Kernel client capability and its TCP implementation.
//!
//! The supervisor only needs three operations from a kernel connection:
//! run code, wait until the kernel answers, and read the next output
//! event with a bounded wait. [`KernelClient`] captures exactly that so
//! the flush loop and the relay handler can be exercised against fakes.
//!
//! [`TcpKernelClient`] speaks newline-delimited JSON shaped like Jupyter
//! messages (`msg_type` + `content`) to the address found in the
//! connection descriptor. Reply messages (`*_reply`) are routed to a reply
//! queue; everything else is treated as output.

use std::future::Future;
use std::net::IpAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::kernel_event::{KernelEvent, KernelMessage};
use crate::relay::codec::LineCodec;
use crate::{AppError, Result};

const OUTPUT_CAPACITY: usize = 1024;
const REPLY_CAPACITY: usize = 64;

/// Kernel connection shared between the relay handler and the flush loop.
///
/// Hold the lock for a single call only.
pub type SharedKernelClient = Arc<Mutex<Box<dyn KernelClient>>>;

/// Wrap a client for sharing.
#[must_use]
pub fn shared(client: Box<dyn KernelClient>) -> SharedKernelClient {
    Arc::new(Mutex::new(client))
}

/// Operations the supervisor consumes from a live kernel.
pub trait KernelClient: Send {
    /// Submit `code` for execution. Output arrives through
    /// [`next_output`](Self::next_output).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the request cannot be written.
    fn execute<'a>(&'a mut self, code: &'a str)
        -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Block until the kernel answers a readiness probe.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` on timeout or connection loss.
    fn wait_for_ready(
        &mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Next output event, or `Ok(None)` when nothing arrived within
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` for an undecodable event or a closed
    /// output channel.
    fn next_output(
        &mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<KernelEvent>>> + Send + '_>>;
}

/// Contents of the connection descriptor written by the kernel launcher.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionDescriptor {
    /// Transport name; only `tcp` is supported.
    #[serde(default = "default_transport")]
    pub transport: String,
    /// Address the kernel listens on.
    pub ip: IpAddr,
    /// Port the kernel listens on.
    pub port: u16,
}

fn default_transport() -> String {
    "tcp".into()
}

impl ConnectionDescriptor {
    /// Parse descriptor text.
    ///
    /// `Ok(None)` means the text is empty or cut short, as when the
    /// launcher has not finished writing it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` for complete text that is not a usable
    /// descriptor. Jupyter (ZMQ) connection files get a dedicated message
    /// since this client only speaks newline-delimited JSON over TCP.
    pub fn parse(raw: &str) -> Result<Option<Self>> {
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) if err.is_eof() => return Ok(None),
            Err(err) => {
                return Err(AppError::Kernel(format!(
                    "invalid connection descriptor: {err}"
                )))
            }
        };
        if value.get("port").is_none() && value.get("shell_port").is_some() {
            return Err(AppError::Kernel(
                "connection descriptor is a Jupyter (ZMQ) connection file; the kernel \
                 launcher must write {\"transport\":\"tcp\",\"ip\":..,\"port\":..} and speak \
                 newline-delimited JSON"
                    .into(),
            ));
        }
        let descriptor: Self = serde_json::from_value(value)
            .map_err(|err| AppError::Kernel(format!("invalid connection descriptor: {err}")))?;
        if descriptor.transport != "tcp" {
            return Err(AppError::Kernel(format!(
                "unsupported kernel transport: {}",
                descriptor.transport
            )));
        }
        Ok(Some(descriptor))
    }

    /// Read and parse a descriptor file; see [`parse`](Self::parse).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be read and
    /// `AppError::Kernel` if it is not a usable descriptor.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::parse(&raw)
    }
}

/// Kernel client over a TCP connection.
pub struct TcpKernelClient {
    writer: OwnedWriteHalf,
    output_rx: mpsc::Receiver<Result<KernelEvent>>,
    reply_rx: mpsc::Receiver<KernelMessage>,
    reader: JoinHandle<()>,
}

impl TcpKernelClient {
    /// Connect to the kernel described by `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Kernel` if the connection cannot be opened.
    pub async fn connect(descriptor: &ConnectionDescriptor) -> Result<Self> {
        let stream = TcpStream::connect((descriptor.ip, descriptor.port))
            .await
            .map_err(|err| {
                AppError::Kernel(format!(
                    "failed to connect to kernel at {}:{}: {err}",
                    descriptor.ip, descriptor.port
                ))
            })?;
        let (read_half, writer) = stream.into_split();
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CAPACITY);
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_CAPACITY);
        let reader = tokio::spawn(async move {
            let mut lines = FramedRead::new(read_half, LineCodec::new());
            while let Some(item) = lines.next().await {
                let line = match item {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(%err, "kernel connection read failed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let routed = route_line(&line);
                let delivered = match routed {
                    Routed::Reply(message) => reply_tx.send(message).await.is_ok(),
                    Routed::Output(event) => output_tx.send(event).await.is_ok(),
                };
                if !delivered {
                    break;
                }
            }
            debug!("kernel connection reader exiting");
        });

        info!(ip = %descriptor.ip, port = descriptor.port, "kernel client connected");
        Ok(Self {
            writer,
            output_rx,
            reply_rx,
            reader,
        })
    }

    async fn send_request(&mut self, msg_type: &str, content: serde_json::Value) -> Result<()> {
        let request = json!({
            "msg_id": Uuid::new_v4().to_string(),
            "msg_type": msg_type,
            "content": content,
        });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|err| AppError::Kernel(format!("failed to send {msg_type}: {err}")))
    }
}

impl Drop for TcpKernelClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

enum Routed {
    Reply(KernelMessage),
    Output(Result<KernelEvent>),
}

fn route_line(line: &str) -> Routed {
    match serde_json::from_str::<KernelMessage>(line) {
        Ok(message) if message.msg_type.ends_with("_reply") => Routed::Reply(message),
        Ok(message) => Routed::Output(KernelEvent::from_message(message)),
        Err(err) => Routed::Output(Err(AppError::Kernel(format!(
            "malformed kernel message: {err}"
        )))),
    }
}

impl KernelClient for TcpKernelClient {
    fn execute<'a>(
        &'a mut self,
        code: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.send_request(
                "execute_request",
                json!({ "code": code, "silent": false, "store_history": true }),
            )
            .await
        })
    }

    fn wait_for_ready(
        &mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.send_request("kernel_info_request", json!({})).await?;
            let wait = async {
                while let Some(reply) = self.reply_rx.recv().await {
                    if reply.msg_type == "kernel_info_reply" {
                        return Ok(());
                    }
                    debug!(msg_type = reply.msg_type, "ignoring reply while waiting for ready");
                }
                Err(AppError::Kernel(
                    "kernel connection closed before ready".into(),
                ))
            };
            tokio::time::timeout(timeout, wait).await.map_err(|_| {
                AppError::Kernel(format!("kernel not ready within {timeout:?}"))
            })?
        })
    }

    fn next_output(
        &mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<KernelEvent>>> + Send + '_>> {
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.output_rx.recv()).await {
                Ok(Some(event)) => event.map(Some),
                Ok(None) => Err(AppError::Kernel("kernel output channel closed".into())),
                Err(_elapsed) => Ok(None),
            }
        })
    }
}
