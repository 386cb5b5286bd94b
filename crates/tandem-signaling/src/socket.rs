//! The supervisor task behind one signaling socket.
//!
//! Each socket runs in its own task. The task connects, sends the
//! handshake, pumps frames both ways, and reconnects according to its
//! [`ReconnectPolicy`]. The rest of the process talks to it only through
//! channels: outbound bytes in, [`SignalingEvent`]s out, a `watch` for
//! state and another for shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tandem_protocol::{Decoded, WireCodec};
use tandem_transport::{Connection, Connector};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::policy::{CloseKind, ReconnectDecision, ReconnectPolicy};
use crate::{SignalingError, SocketKind, SocketState};

/// Something the signaling layer reports to its owner.
#[derive(Debug)]
pub enum SignalingEvent {
    /// A socket changed state.
    StateChanged {
        socket: SocketKind,
        state: SocketState,
    },
    /// A decoded inbound message. Batches arrive already flattened.
    Message {
        socket: SocketKind,
        message: Decoded,
    },
    /// The socket stopped for good: closed normally by the server, or out
    /// of reconnect attempts. Sent at most once per socket.
    ConnectionLost { socket: SocketKind },
}

/// An outbound frame, stamped with the connection it was accepted for.
pub(crate) struct Outbound {
    generation: u64,
    bytes: Vec<u8>,
}

/// Why a connection ended, from the supervisor's point of view.
enum Ended {
    Closed(CloseKind),
    Shutdown,
}

// ---------------------------------------------------------------------------
// SocketHandle: the caller side
// ---------------------------------------------------------------------------

/// The caller's end of one supervised socket.
pub(crate) struct SocketHandle {
    kind: SocketKind,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: watch::Receiver<SocketState>,
    generation: Arc<AtomicU64>,
}

impl SocketHandle {
    pub(crate) fn kind(&self) -> SocketKind {
        self.kind
    }

    pub(crate) fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<SocketState> {
        self.state.clone()
    }

    /// Queues `bytes` for the current connection.
    ///
    /// Accepted while Connecting or Open; anything else is rejected.
    pub(crate) fn send(&self, bytes: Vec<u8>) -> Result<(), SignalingError> {
        let generation = self.generation.load(Ordering::Acquire);
        if !self.state().accepts_sends() {
            return Err(SignalingError::NotConnected(self.kind));
        }
        self.outbound
            .send(Outbound { generation, bytes })
            .map_err(|_| SignalingError::Shutdown)
    }
}

// ---------------------------------------------------------------------------
// Supervisor: the task side
// ---------------------------------------------------------------------------

pub(crate) struct Supervisor<C: Connector> {
    kind: SocketKind,
    url: String,
    connector: Arc<C>,
    codec: WireCodec,
    policy: ReconnectPolicy,
    state: watch::Sender<SocketState>,
    generation: Arc<AtomicU64>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    handshake: watch::Receiver<Vec<u8>>,
    shutdown: watch::Receiver<bool>,
}

/// Everything a supervisor needs besides its own channels.
pub(crate) struct SupervisorParts<C> {
    pub(crate) kind: SocketKind,
    pub(crate) url: String,
    pub(crate) connector: Arc<C>,
    pub(crate) codec: WireCodec,
    pub(crate) policy: ReconnectPolicy,
    pub(crate) events: mpsc::UnboundedSender<SignalingEvent>,
    pub(crate) handshake: watch::Receiver<Vec<u8>>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl<C: Connector> Supervisor<C> {
    /// Builds a supervisor and the handle that feeds it.
    pub(crate) fn new(parts: SupervisorParts<C>) -> (Self, SocketHandle) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SocketState::Disconnected);
        let generation = Arc::new(AtomicU64::new(0));
        let handle = SocketHandle {
            kind: parts.kind,
            outbound: outbound_tx,
            state: state_rx,
            generation: Arc::clone(&generation),
        };
        let supervisor = Self {
            kind: parts.kind,
            url: parts.url,
            connector: parts.connector,
            codec: parts.codec,
            policy: parts.policy,
            state: state_tx,
            generation,
            outbound: outbound_rx,
            events: parts.events,
            handshake: parts.handshake,
            shutdown: parts.shutdown,
        };
        (supervisor, handle)
    }

    /// Runs until shutdown, a normal close, or the attempt limit.
    pub(crate) async fn run(mut self) {
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.generation.fetch_add(1, Ordering::AcqRel);
            self.set_state(SocketState::Connecting);
            let attempt = self.policy.begin_attempt();
            info!(socket = %self.kind, url = %self.url, attempt, "connecting");

            let ended = tokio::select! {
                result = self.connector.connect(&self.url) => match result {
                    Ok(conn) => self.serve(conn, &mut shutdown).await,
                    Err(err) => {
                        warn!(socket = %self.kind, attempt, error = %err, "connect failed");
                        Ended::Closed(CloseKind::Abnormal)
                    }
                },
                _ = shutdown_requested(&mut shutdown) => Ended::Shutdown,
            };
            self.discard_pending();
            self.set_state(SocketState::Disconnected);

            let kind = match ended {
                Ended::Shutdown => break,
                Ended::Closed(kind) => kind,
            };
            match self.policy.on_close(kind) {
                ReconnectDecision::Stop => {
                    info!(socket = %self.kind, "closed normally, not reconnecting");
                    let _ = self.events.send(SignalingEvent::ConnectionLost { socket: self.kind });
                    break;
                }
                ReconnectDecision::GiveUp => {
                    error!(
                        socket = %self.kind,
                        attempts = self.policy.attempts(),
                        "connection lost, giving up"
                    );
                    let _ = self.events.send(SignalingEvent::ConnectionLost { socket: self.kind });
                    break;
                }
                ReconnectDecision::Retry(delay) => {
                    debug!(socket = %self.kind, ?delay, "reconnect scheduled");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_requested(&mut shutdown) => {
                            debug!(socket = %self.kind, "scheduled reconnect cancelled");
                            break;
                        }
                    }
                }
            }
        }
        info!(socket = %self.kind, "supervisor stopped");
    }

    /// Drives one open connection until it ends.
    async fn serve(&mut self, conn: C::Connection, shutdown: &mut watch::Receiver<bool>) -> Ended {
        let handshake = self.handshake.borrow().clone();
        if let Err(err) = conn.send(&handshake).await {
            warn!(socket = %self.kind, error = %err, "handshake send failed");
            return Ended::Closed(CloseKind::Abnormal);
        }
        self.policy.on_open();
        self.set_state(SocketState::Open);
        let generation = self.generation.load(Ordering::Acquire);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => {
                    self.set_state(SocketState::Closing);
                    if let Err(err) = conn.close().await {
                        debug!(socket = %self.kind, error = %err, "close failed");
                    }
                    return Ended::Shutdown;
                }
                item = self.outbound.recv() => match item {
                    Some(frame) if frame.generation == generation => {
                        if let Err(err) = conn.send(&frame.bytes).await {
                            warn!(socket = %self.kind, error = %err, "send failed");
                            return Ended::Closed(CloseKind::Abnormal);
                        }
                    }
                    Some(_) => debug!(socket = %self.kind, "dropping frame queued for an earlier connection"),
                    None => {
                        self.set_state(SocketState::Closing);
                        let _ = conn.close().await;
                        return Ended::Shutdown;
                    }
                },
                received = conn.recv() => match received {
                    Ok(Some(bytes)) => self.dispatch(&bytes),
                    Ok(None) => return Ended::Closed(CloseKind::Normal),
                    Err(err) => {
                        warn!(socket = %self.kind, error = %err, "connection dropped");
                        return Ended::Closed(CloseKind::Abnormal);
                    }
                },
            }
        }
    }

    fn dispatch(&self, bytes: &[u8]) {
        let decoded = match self.codec.decode_message(bytes) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(socket = %self.kind, len = bytes.len(), error = %err, "undecodable frame skipped");
                return;
            }
        };
        for message in decoded.flatten() {
            match message {
                // Already logged by the codec.
                Decoded::Malformed { .. } | Decoded::Unknown { .. } => {}
                message => {
                    let _ = self.events.send(SignalingEvent::Message {
                        socket: self.kind,
                        message,
                    });
                }
            }
        }
    }

    /// Drops frames queued for a connection that no longer exists.
    fn discard_pending(&mut self) {
        let mut dropped = 0usize;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(socket = %self.kind, dropped, "discarding frames queued for a dropped connection");
        }
    }

    fn set_state(&self, state: SocketState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            debug!(socket = %self.kind, %state, "socket state");
            let _ = self.events.send(SignalingEvent::StateChanged {
                socket: self.kind,
                state,
            });
        }
    }
}

/// Resolves once shutdown is requested or the requester is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|requested| *requested).await;
}
