//! The two-socket signaling channel.

use std::sync::Arc;

use tandem_protocol::{SignalingEnvelope, WireCodec, WireMessage};
use tandem_transport::Connector;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::policy::ReconnectPolicy;
use crate::socket::{SocketHandle, Supervisor, SupervisorParts};
use crate::{SignalingConfig, SignalingError, SignalingEvent, SocketKind, SocketState};

/// The control plane: a reliable socket and an optional low-latency one,
/// each supervised by its own task.
///
/// # Example
///
/// ```rust,ignore
/// let (channel, mut events) = SignalingChannel::start(
///     WebSocketConnector,
///     SignalingConfig::new("wss://host/signal"),
///     WireCodec::new(),
///     &handshake,
/// )?;
/// while let Some(event) = events.recv().await {
///     // ...
/// }
/// ```
pub struct SignalingChannel {
    reliable: SocketHandle,
    low_latency: Option<SocketHandle>,
    codec: WireCodec,
    handshake: watch::Sender<Vec<u8>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingChannel {
    /// Spawns the socket supervisors and starts connecting.
    ///
    /// `handshake` is sent first on every connection, reconnects
    /// included; see [`set_handshake`](Self::set_handshake).
    pub fn start<C: Connector>(
        connector: C,
        config: SignalingConfig,
        codec: WireCodec,
        handshake: &SignalingEnvelope,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>), SignalingError> {
        config.validate()?;
        let connector = Arc::new(connector);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (handshake_tx, handshake_rx) =
            watch::channel(codec.encode_message(&WireMessage::Signaling(handshake.clone())));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::with_capacity(2);
        let mut supervise = |kind: SocketKind, url: String| {
            let (supervisor, handle) = Supervisor::new(SupervisorParts {
                kind,
                url,
                connector: Arc::clone(&connector),
                codec: codec.clone(),
                policy: ReconnectPolicy::new(config.reconnect_delay, config.max_attempts),
                events: events_tx.clone(),
                handshake: handshake_rx.clone(),
                shutdown: shutdown_rx.clone(),
            });
            tasks.push(tokio::spawn(supervisor.run()));
            handle
        };
        let reliable = supervise(SocketKind::Reliable, config.reliable_url.clone());
        let low_latency = config
            .low_latency_url
            .clone()
            .map(|url| supervise(SocketKind::LowLatency, url));

        tracing::info!(
            url = %config.reliable_url,
            low_latency = low_latency.is_some(),
            "signaling started"
        );
        let channel = Self {
            reliable,
            low_latency,
            codec,
            handshake: handshake_tx,
            shutdown: shutdown_tx,
            tasks,
        };
        Ok((channel, events_rx))
    }

    /// Sends raw bytes on `socket`. Fire-and-forget.
    ///
    /// Queued while the socket is connecting and flushed after the
    /// handshake. Rejected with [`SignalingError::NotConnected`] while it
    /// is disconnected or closing. Without a low-latency socket,
    /// low-latency traffic uses the reliable one.
    pub fn send(&self, socket: SocketKind, bytes: Vec<u8>) -> Result<(), SignalingError> {
        if *self.shutdown.borrow() {
            return Err(SignalingError::Shutdown);
        }
        self.handle(socket).send(bytes)
    }

    /// Encodes and sends an envelope on `socket`.
    pub fn send_envelope(
        &self,
        socket: SocketKind,
        envelope: SignalingEnvelope,
    ) -> Result<(), SignalingError> {
        tracing::debug!(
            %socket,
            to = %envelope.target,
            kind = envelope.message.name(),
            "signal out"
        );
        let bytes = self.codec.encode_message(&WireMessage::Signaling(envelope));
        self.send(socket, bytes)
    }

    /// Replaces the handshake sent on future connections.
    pub fn set_handshake(&self, handshake: &SignalingEnvelope) {
        let bytes = self.codec.encode_message(&WireMessage::Signaling(handshake.clone()));
        self.handshake.send_replace(bytes);
    }

    /// Current state of `socket`. An unconfigured low-latency socket
    /// reports the reliable one's state.
    pub fn state(&self, socket: SocketKind) -> SocketState {
        self.handle(socket).state()
    }

    /// Observes state changes of `socket`.
    pub fn watch_state(&self, socket: SocketKind) -> watch::Receiver<SocketState> {
        self.handle(socket).watch()
    }

    /// `true` if a separate low-latency socket is configured.
    pub fn has_low_latency(&self) -> bool {
        self.low_latency.is_some()
    }

    /// Cancels any scheduled reconnect, closes both sockets, and waits
    /// for the supervisors to stop. Idempotent.
    pub async fn shutdown(&mut self) {
        if !self.shutdown.send_replace(true) {
            tracing::info!("signaling shutting down");
        }
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "socket supervisor panicked");
            }
        }
    }

    fn handle(&self, socket: SocketKind) -> &SocketHandle {
        match (socket, &self.low_latency) {
            (SocketKind::LowLatency, Some(handle)) => handle,
            _ => &self.reliable,
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("reliable", &self.reliable.state())
            .field("low_latency", &self.low_latency.as_ref().map(|h| (h.kind(), h.state())))
            .finish()
    }
}
