//! Identity-aware relay endpoint over a local socket.
//!
//! Listens on (front-end) or connects to (kernel-manager) a named pipe /
//! Unix domain socket using the `interprocess` crate. Each side announces
//! itself with a `hello` frame; afterwards envelopes flow as `message`
//! frames addressed by identity. A new connection only becomes the peer
//! once its hello names the other identity, so a stray client cannot
//! displace a live peer.
//!
//! Sends never block and are never acknowledged. Envelopes queued while the
//! addressed peer is not connected wait in an outbox until their ttl lapses.
//! [`RelayEndpoint::run`] is the only dispatch loop of a process; inbound
//! envelopes are handed to a [`RelayHandler`] inline, so a slow handler
//! stalls all relay traffic of that process.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::StreamExt;
use interprocess::local_socket::tokio::{prelude::*, Listener, RecvHalf, SendHalf, Stream};
use interprocess::local_socket::{GenericNamespaced, ListenerOptions, ToNsName};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::envelope::Envelope;
use crate::models::identity::Identity;
use crate::relay::codec::{Frame, LineCodec};
use crate::{AppError, Result};

/// Cadence of outbox expiry and connector reconnect attempts.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

const INBOUND_CAPACITY: usize = 256;

/// Which side of the link this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Binds the socket name and accepts the peer.
    Listener,
    /// Connects to the socket name, reconnecting while disconnected.
    Connector,
}

/// Receiver of inbound envelopes.
///
/// Implementations run inside the dispatch loop and must not perform
/// long-running work inline.
pub trait RelayHandler: Send + Sync {
    /// Handle one envelope sent by `from`.
    fn on_receive(
        &self,
        from: Identity,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Envelope queued for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Recipient.
    pub to: Identity,
    /// Envelope to deliver.
    pub envelope: Envelope,
}

/// Cloneable fire-and-forget send handle.
#[derive(Debug, Clone)]
pub struct RelaySender {
    identity: Identity,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl RelaySender {
    /// Create a sender not yet attached to a dispatch loop.
    ///
    /// Whoever holds the receiver decides what happens to queued envelopes.
    #[must_use]
    pub fn unbound(identity: Identity) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { identity, tx }, rx)
    }

    /// Identity envelopes are sent as.
    #[must_use]
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Queue `envelope` for `to`. Never blocks and never fails; once the
    /// dispatch loop has stopped the envelope is discarded.
    pub fn send(&self, envelope: Envelope, to: Identity) {
        let kind = envelope.kind().as_str();
        if self.tx.send(Outbound { to, envelope }).is_err() {
            debug!(kind, %to, "relay loop stopped; envelope discarded");
        }
    }
}

/// One side of the relay.
pub struct RelayEndpoint {
    identity: Identity,
    role: Role,
    name: String,
    listener: Option<Listener>,
    sender: RelaySender,
    queue_rx: mpsc::UnboundedReceiver<Outbound>,
}

impl RelayEndpoint {
    /// Prepare an endpoint. The listener role binds `name` immediately; the
    /// connector role connects from within [`run`](Self::run).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Relay` if the socket name is invalid or cannot be
    /// bound.
    pub fn connect(identity: Identity, role: Role, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let listener = match role {
            Role::Listener => {
                let listener_name = name
                    .as_str()
                    .to_ns_name::<GenericNamespaced>()
                    .map_err(|err| AppError::Relay(format!("invalid relay name '{name}': {err}")))?;
                let listener = ListenerOptions::new()
                    .name(listener_name)
                    .create_tokio()
                    .map_err(|err| AppError::Relay(format!("failed to bind relay: {err}")))?;
                info!(relay_name = %name, %identity, "relay listening");
                Some(listener)
            }
            Role::Connector => None,
        };
        let (sender, queue_rx) = RelaySender::unbound(identity);
        Ok(Self {
            identity,
            role,
            name,
            listener,
            sender,
            queue_rx,
        })
    }

    /// Identity of this endpoint.
    #[must_use]
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Send handle usable from any task.
    #[must_use]
    pub fn sender(&self) -> RelaySender {
        self.sender.clone()
    }

    /// Dispatch loop. Returns when `ct` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Relay` if the relay name is invalid.
    pub async fn run<H>(self, handler: &H, ct: CancellationToken) -> Result<()>
    where
        H: RelayHandler + ?Sized,
    {
        let Self {
            identity,
            role,
            name,
            listener,
            sender: _sender,
            mut queue_rx,
        } = self;
        // Validate once so reconnect attempts cannot fail on the name.
        name.as_str()
            .to_ns_name::<GenericNamespaced>()
            .map_err(|err| AppError::Relay(format!("invalid relay name '{name}': {err}")))?;

        let span = info_span!("relay", %identity, relay_name = %name);
        async move {
            let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
            let mut peer: Option<Peer> = None;
            // Connections whose hello has not arrived yet.
            let mut pending: Vec<Peer> = Vec::new();
            let mut outbox = Outbox::new(identity);
            let mut next_conn_id = 0_u64;
            let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
            maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("relay shutting down");
                        break;
                    }
                    accepted = accept_next(listener.as_ref()) => {
                        match accepted {
                            Ok(stream) => {
                                next_conn_id += 1;
                                match Peer::establish(stream, next_conn_id, identity, inbound_tx.clone()).await {
                                    Ok(candidate) => pending.push(candidate),
                                    Err(err) => warn!(%err, "relay handshake failed"),
                                }
                            }
                            Err(err) => warn!(%err, "relay accept failed"),
                        }
                    }
                    Some(inbound) = inbound_rx.recv() => {
                        match inbound {
                            Inbound::Frame(conn_id, Frame::Hello { from }) => {
                                let Some(index) = pending.iter().position(|p| p.id == conn_id) else {
                                    debug!(from, "repeated relay hello ignored");
                                    continue;
                                };
                                let mut candidate = pending.swap_remove(index);
                                match Identity::from_token(&from) {
                                    Some(remote) if remote != identity => {
                                        info!(peer = %remote, "relay peer connected");
                                        candidate.identity = Some(remote);
                                        if peer.replace(candidate).is_some() {
                                            info!("relay connection replaced by a newer one");
                                        }
                                        outbox.deliver(&mut peer).await;
                                    }
                                    _ => debug!(from, "relay hello from unexpected identity; connection dropped"),
                                }
                            }
                            Inbound::Frame(conn_id, Frame::Message { from, to, payload, .. }) => {
                                if !peer.as_ref().is_some_and(|p| p.id == conn_id) {
                                    debug!(from, "relay frame before hello dropped");
                                    continue;
                                }
                                if to != identity.token() {
                                    debug!(to, "relay frame for another identity dropped");
                                    continue;
                                }
                                let Some(sender) = Identity::from_token(&from) else {
                                    debug!(from, "relay frame from unknown identity dropped");
                                    continue;
                                };
                                handler.on_receive(sender, payload).await;
                            }
                            Inbound::Closed(conn_id) => {
                                if peer.as_ref().is_some_and(|p| p.id == conn_id) {
                                    info!("relay peer disconnected");
                                    peer = None;
                                } else {
                                    pending.retain(|p| p.id != conn_id);
                                }
                            }
                        }
                    }
                    Some(outbound) = queue_rx.recv() => {
                        outbox.push(outbound);
                        outbox.deliver(&mut peer).await;
                    }
                    _ = maintenance.tick() => {
                        if role == Role::Connector && peer.is_none() && pending.is_empty() {
                            next_conn_id += 1;
                            match connect_stream(&name).await {
                                Ok(stream) => {
                                    match Peer::establish(stream, next_conn_id, identity, inbound_tx.clone()).await {
                                        Ok(candidate) => pending.push(candidate),
                                        Err(err) => warn!(%err, "relay handshake failed"),
                                    }
                                }
                                Err(err) => debug!(%err, "relay connect attempt failed"),
                            }
                        }
                        outbox.deliver(&mut peer).await;
                    }
                }
            }

            // Hand over whatever was queued during shutdown.
            while let Ok(outbound) = queue_rx.try_recv() {
                outbox.push(outbound);
            }
            outbox.deliver(&mut peer).await;
            if !outbox.is_empty() {
                debug!(pending = outbox.len(), "relay stopped with undelivered envelopes");
            }
        }
        .instrument(span)
        .await;

        Ok(())
    }
}

async fn accept_next(listener: Option<&Listener>) -> std::io::Result<Stream> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn connect_stream(name: &str) -> std::io::Result<Stream> {
    let name = name.to_ns_name::<GenericNamespaced>()?;
    Stream::connect(name).await
}

/// Event from a connection reader task.
enum Inbound {
    Frame(u64, Frame),
    Closed(u64),
}

/// The single live connection of an endpoint.
struct Peer {
    id: u64,
    /// Learned from the peer's `hello`.
    identity: Option<Identity>,
    writer: SendHalf,
    reader: JoinHandle<()>,
}

impl Peer {
    async fn establish(
        stream: Stream,
        id: u64,
        local: Identity,
        inbound: mpsc::Sender<Inbound>,
    ) -> Result<Self> {
        let (recv, writer) = stream.split();
        let mut peer = Self {
            id,
            identity: None,
            writer,
            reader: tokio::spawn(read_frames(id, recv, inbound)),
        };
        let hello = Frame::Hello {
            from: local.token().to_owned(),
        };
        peer.write_line(&hello.to_line()?).await?;
        Ok(peer)
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        self.writer
            .write_all(buf.as_bytes())
            .await
            .map_err(|err| AppError::Relay(format!("relay write failed: {err}")))
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_frames(id: u64, recv: RecvHalf, inbound: mpsc::Sender<Inbound>) {
    let mut frames = FramedRead::new(recv, LineCodec::new());
    while let Some(item) = frames.next().await {
        match item {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                match Frame::from_line(&line) {
                    Ok(frame) => {
                        if inbound.send(Inbound::Frame(id, frame)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => debug!(%err, "undecodable relay frame dropped"),
                }
            }
            Err(err) => {
                warn!(%err, "relay read failed");
                break;
            }
        }
    }
    let _ = inbound.send(Inbound::Closed(id)).await;
}

/// Encoded frame waiting for its recipient.
struct Pending {
    to: Identity,
    line: String,
    expires_at: Instant,
}

/// Ttl-bounded buffer of undelivered frames.
struct Outbox {
    local: Identity,
    queue: VecDeque<Pending>,
}

impl Outbox {
    fn new(local: Identity) -> Self {
        Self {
            local,
            queue: VecDeque::new(),
        }
    }

    fn push(&mut self, outbound: Outbound) {
        let Outbound { to, envelope } = outbound;
        let ttl = envelope.ttl();
        let frame = Frame::Message {
            from: self.local.token().to_owned(),
            to: to.token().to_owned(),
            ttl: ttl.as_secs(),
            payload: envelope,
        };
        match frame.to_line() {
            Ok(line) => self.queue.push_back(Pending {
                to,
                line,
                expires_at: Instant::now() + ttl,
            }),
            Err(err) => warn!(%err, "failed to encode relay frame"),
        }
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn prune(&mut self, now: Instant) {
        let before = self.queue.len();
        self.queue.retain(|pending| pending.expires_at > now);
        let expired = before - self.queue.len();
        if expired > 0 {
            debug!(expired, "expired relay envelopes dropped");
        }
    }

    /// Write every pending frame addressed to the connected peer.
    async fn deliver(&mut self, peer: &mut Option<Peer>) {
        self.prune(Instant::now());
        let Some(current) = peer.as_mut() else {
            return;
        };
        let Some(remote) = current.identity else {
            return;
        };

        let mut kept = VecDeque::new();
        let mut failed = false;
        while let Some(pending) = self.queue.pop_front() {
            if pending.to != remote {
                kept.push_back(pending);
                continue;
            }
            if let Err(err) = current.write_line(&pending.line).await {
                warn!(%err, "relay connection dropped during write");
                kept.push_back(pending);
                kept.extend(self.queue.drain(..));
                failed = true;
                break;
            }
        }
        self.queue = kept;
        if failed {
            *peer = None;
        }
    }
}
