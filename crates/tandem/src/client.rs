//! The client runtime: one session-loop task and a cloneable handle.
//!
//! The loop owns every piece of mutable session state: the peer
//! registry, the token store and the lifecycle. Signaling events, peer
//! transport callbacks, HTTP completions and application commands all
//! arrive on channels and are applied one at a time, so no session logic
//! ever runs concurrently against the same state.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tandem_http::{ApiClient, HttpError, Identity, JoinResponse, Library, SessionStatus, TokenStore};
use tandem_protocol::{
    ChannelSpec, Decoded, Frame, PayloadCategory, PeerId, SignalingEnvelope, SignalingMessage,
    Token, WireCodec,
};
use tandem_session::{
    AnonymousIdentity, ChannelState, Credentials, Delivery, FrameSink, IdentityProvider,
    PeerConnectorFactory, PeerEvent, PeerRegistry, SessionError, Subscribers, SubscriptionId,
};
use tandem_signaling::{SignalingChannel, SignalingEvent, SocketKind};
use tandem_tick::{GuardSet, GuardWaiter, TickScheduler};
use tandem_transport::{Connector, WebSocketConnector};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::lifecycle::{Effect, LifecycleState, SessionManager};
use crate::{ClientConfig, ClientEvent, ClientState, Condition, DiscardPayloads, PayloadHandler, TandemError};

/// Capacity of the command channel.
const COMMAND_BUFFER: usize = 64;

/// Upper bound on the best-effort logout request.
const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`TandemClient`].
///
/// # Example
///
/// ```rust,ignore
/// let client = TandemClientBuilder::new(config)
///     .identity(MyIdentity::load()?)
///     .payload_handler(|peer: &PeerId, category, bytes: &[u8]| {
///         scene.apply(peer, category, bytes);
///     })
///     .build()?;
///
/// client.connect().await?;
/// client.wait_until(Condition::Connected).await?;
/// ```
pub struct TandemClientBuilder<I = AnonymousIdentity> {
    config: ClientConfig,
    identity: I,
    peer_connector: Option<Arc<dyn PeerConnectorFactory>>,
    payloads: Box<dyn PayloadHandler>,
    codec: WireCodec,
}

impl TandemClientBuilder<AnonymousIdentity> {
    /// A builder with an anonymous identity, relay-only peers and a
    /// payload handler that discards everything.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            identity: AnonymousIdentity,
            peer_connector: None,
            payloads: Box::new(DiscardPayloads),
            codec: WireCodec::new(),
        }
    }
}

impl<I: IdentityProvider> TandemClientBuilder<I> {
    /// Sets the identity provider.
    pub fn identity<J: IdentityProvider>(self, identity: J) -> TandemClientBuilder<J> {
        TandemClientBuilder {
            config: self.config,
            identity,
            peer_connector: self.peer_connector,
            payloads: self.payloads,
            codec: self.codec,
        }
    }

    /// Enables direct peer transports. Without one every peer is reached
    /// through the relay.
    pub fn peer_connector(mut self, factory: Arc<dyn PeerConnectorFactory>) -> Self {
        self.peer_connector = Some(factory);
        self
    }

    pub fn payload_handler(mut self, handler: impl PayloadHandler) -> Self {
        self.payloads = Box::new(handler);
        self
    }

    /// Replaces the wire codec, e.g. one with extension modules.
    pub fn codec(mut self, codec: WireCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Starts the client over WebSockets. Must be called inside a Tokio
    /// runtime.
    pub fn build(self) -> Result<TandemClient, TandemError> {
        self.build_with(WebSocketConnector)
    }

    /// Starts the client over `connector`. Must be called inside a Tokio
    /// runtime.
    pub fn build_with<C>(self, connector: C) -> Result<TandemClient, TandemError>
    where
        C: Connector + Clone,
    {
        self.config.validate()?;
        let tokens = TokenStore::new();
        let api = ApiClient::new(
            &self.config.api_base_url,
            tokens.watcher(),
            self.config.retry.clone(),
        )?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let registry = PeerRegistry::new(
            Arc::new(RelayOutbox(frames_tx)),
            self.peer_connector,
            self.codec.clone(),
            peer_events_tx,
        );
        let scheduler = TickScheduler::new(self.config.tick.clone());

        let session = SessionLoop {
            config: self.config,
            connector,
            identity: Arc::new(self.identity),
            api,
            tokens,
            codec: self.codec,
            lifecycle: SessionManager::new(),
            registry,
            signaling: None,
            signaling_events: None,
            handshake_deadline: None,
            pending_connects: Vec::new(),
            commands: command_rx,
            peer_events: peer_events_rx,
            relay_frames: frames_rx,
            epoch: 0,
            completions_tx,
            completions: completions_rx,
            payloads: self.payloads,
            subscribers: Subscribers::new(),
            guards: GuardSet::new(),
            scheduler,
        };
        tokio::spawn(session.run());

        Ok(TandemClient {
            commands: command_tx,
        })
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

enum Command {
    Connect {
        reply: oneshot::Sender<Result<PeerId, TandemError>>,
    },
    Join {
        reply: oneshot::Sender<bool>,
    },
    Logout {
        reply: oneshot::Sender<()>,
    },
    ConnectPeer {
        peer: PeerId,
        reply: oneshot::Sender<Result<(), TandemError>>,
    },
    OpenChannel {
        peer: PeerId,
        spec: ChannelSpec,
        reply: oneshot::Sender<Result<(), TandemError>>,
    },
    Send {
        peer: PeerId,
        reliable: bool,
        category: PayloadCategory,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), TandemError>>,
    },
    WaitUntil {
        condition: Condition,
        reply: oneshot::Sender<GuardWaiter>,
    },
    State {
        reply: oneshot::Sender<ClientState>,
    },
    Subscribe {
        callback: Box<dyn FnMut(&ClientEvent) + Send>,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running client. Cheap to clone.
///
/// Every method hands a command to the session loop and waits for its
/// reply. Once the loop has stopped they return [`TandemError::Stopped`].
#[derive(Clone)]
pub struct TandemClient {
    commands: mpsc::Sender<Command>,
}

impl TandemClient {
    /// Opens signaling and resolves with our peer id once the server
    /// acknowledges the handshake. Already-connected clients resolve at
    /// once.
    pub async fn connect(&self) -> Result<PeerId, TandemError> {
        self.request(|reply| Command::Connect { reply }).await?
    }

    /// Joins the session. Returns `false` if a join was already in flight
    /// or the client is not authenticated.
    pub async fn join(&self) -> Result<bool, TandemError> {
        self.request(|reply| Command::Join { reply }).await
    }

    /// Closes all peers and the sockets, tells the server (best effort),
    /// and forgets the identity.
    pub async fn logout(&self) -> Result<(), TandemError> {
        self.request(|reply| Command::Logout { reply }).await
    }

    /// Starts a session to `peer`.
    pub async fn connect_peer(&self, peer: PeerId) -> Result<(), TandemError> {
        self.request(|reply| Command::ConnectPeer { peer, reply })
            .await?
    }

    /// Requests a channel to a connected peer.
    pub async fn open_channel(&self, peer: PeerId, spec: ChannelSpec) -> Result<(), TandemError> {
        self.request(|reply| Command::OpenChannel { peer, spec, reply })
            .await?
    }

    /// Sends a payload on the first channel to `peer` matching
    /// `reliable` and `category`. Queued while the channel is opening.
    pub async fn send(
        &self,
        peer: PeerId,
        reliable: bool,
        category: PayloadCategory,
        payload: Vec<u8>,
    ) -> Result<(), TandemError> {
        self.request(|reply| Command::Send {
            peer,
            reliable,
            category,
            payload,
            reply,
        })
        .await?
    }

    /// Resolves on the first tick at which `condition` holds.
    pub async fn wait_until(&self, condition: Condition) -> Result<(), TandemError> {
        let waiter = self
            .request(|reply| Command::WaitUntil { condition, reply })
            .await?;
        waiter.await.map_err(|_| TandemError::Stopped)
    }

    /// A snapshot of the client.
    pub async fn state(&self) -> Result<ClientState, TandemError> {
        self.request(|reply| Command::State { reply }).await
    }

    /// Adds a callback for [`ClientEvent`]s. Callbacks run on the session
    /// loop, in subscription order.
    pub async fn subscribe(
        &self,
        callback: impl FnMut(&ClientEvent) + Send + 'static,
    ) -> Result<SubscriptionId, TandemError> {
        let callback = Box::new(callback);
        self.request(|reply| Command::Subscribe { callback, reply })
            .await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, TandemError> {
        self.request(|reply| Command::Unsubscribe { id, reply })
            .await
    }

    /// Closes peers and sockets and stops the session loop.
    pub async fn shutdown(&self) -> Result<(), TandemError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, TandemError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| TandemError::Stopped)?;
        reply_rx.await.map_err(|_| TandemError::Stopped)
    }
}

impl std::fmt::Debug for TandemClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TandemClient")
            .field("stopped", &self.commands.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Relay outbox
// ---------------------------------------------------------------------------

/// Hands relay frames to the session loop, which wraps them in signaling
/// envelopes.
struct RelayOutbox(mpsc::UnboundedSender<Frame>);

impl FrameSink for RelayOutbox {
    fn send_frame(&self, frame: Frame) -> Result<(), SessionError> {
        self.0
            .send(frame)
            .map_err(|_| SessionError::Relay("session loop stopped".into()))
    }
}

// ---------------------------------------------------------------------------
// Session loop
// ---------------------------------------------------------------------------

/// Results of work spawned off the loop.
///
/// Each one is stamped with the epoch it was spawned in; results that
/// outlive their session are dropped.
enum Completion {
    Credentials(Result<Credentials, SessionError>),
    Identity(Result<Identity, HttpError>),
    Status(Result<SessionStatus, HttpError>),
    Join(Result<JoinResponse, HttpError>),
    Libraries(Result<Vec<Library>, HttpError>),
    LibraryApproval { libraries: Vec<String>, approved: bool },
}

struct SessionLoop<C, I> {
    config: ClientConfig,
    connector: C,
    identity: Arc<I>,
    api: ApiClient,
    tokens: TokenStore,
    codec: WireCodec,
    lifecycle: SessionManager,
    registry: PeerRegistry,
    signaling: Option<SignalingChannel>,
    signaling_events: Option<mpsc::UnboundedReceiver<SignalingEvent>>,
    handshake_deadline: Option<Instant>,
    pending_connects: Vec<oneshot::Sender<Result<PeerId, TandemError>>>,
    commands: mpsc::Receiver<Command>,
    peer_events: mpsc::UnboundedReceiver<(PeerId, PeerEvent)>,
    relay_frames: mpsc::UnboundedReceiver<Frame>,
    /// Bumped every time the session is torn down.
    epoch: u64,
    completions_tx: mpsc::UnboundedSender<(u64, Completion)>,
    completions: mpsc::UnboundedReceiver<(u64, Completion)>,
    payloads: Box<dyn PayloadHandler>,
    subscribers: Subscribers<ClientEvent>,
    guards: GuardSet<ClientState>,
    scheduler: TickScheduler,
}

impl<C, I> SessionLoop<C, I>
where
    C: Connector + Clone,
    I: IdentityProvider,
{
    async fn run(mut self) {
        info!("session loop started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                event = next_signaling(&mut self.signaling_events) => self.handle_signaling(event),
                Some((peer, event)) = self.peer_events.recv() => self.handle_peer_event(&peer, event),
                Some((epoch, completion)) = self.completions.recv() => {
                    if epoch == self.epoch {
                        self.handle_completion(completion);
                    } else {
                        debug!(epoch, current = self.epoch, "completion from an ended session dropped");
                    }
                }
                _ = self.scheduler.wait_for_tick() => self.on_tick(),
            }
            self.flush();
        }
        info!("session loop stopped");
    }

    // -- inputs -------------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => match self.lifecycle.state() {
                LifecycleState::Disconnected => {
                    self.pending_connects.push(reply);
                    let effects = self.lifecycle.connect();
                    self.apply(effects);
                }
                LifecycleState::Connecting => self.pending_connects.push(reply),
                _ => {
                    let peer = self.registry.local().clone();
                    let _ = reply.send(Ok(peer));
                }
            },
            Command::Join { reply } => {
                let effects = self.lifecycle.join();
                let started = !effects.is_empty();
                self.apply(effects);
                let _ = reply.send(started);
            }
            Command::Logout { reply } => {
                self.finish_connects(|| Err(TandemError::ConnectionLost));
                let effects = self.lifecycle.logout();
                self.apply(effects);
                self.tokens.clear();
                let _ = reply.send(());
            }
            Command::ConnectPeer { peer, reply } => {
                let _ = reply.send(self.registry.connect(&peer).map_err(Into::into));
            }
            Command::OpenChannel { peer, spec, reply } => {
                let result = self.registry.request_channel(&peer, spec);
                let _ = reply.send(result.map_err(Into::into));
            }
            Command::Send {
                peer,
                reliable,
                category,
                payload,
                reply,
            } => {
                let result = self.registry.send(&peer, reliable, category, payload);
                let _ = reply.send(result.map_err(Into::into));
            }
            Command::WaitUntil { condition, reply } => {
                debug!(%condition, "guard registered");
                let waiter = self
                    .guards
                    .register(move |state: &ClientState| condition.holds(state));
                let _ = reply.send(waiter);
            }
            Command::State { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Subscribe { callback, reply } => {
                let _ = reply.send(self.subscribers.subscribe(callback));
            }
            Command::Unsubscribe { id, reply } => {
                let _ = reply.send(self.subscribers.unsubscribe(id));
            }
            Command::Shutdown { reply } => {
                // Handled by the loop itself.
                let _ = reply.send(());
            }
        }
    }

    fn handle_signaling(&mut self, event: Option<SignalingEvent>) {
        match event {
            None => {
                self.signaling_events = None;
                if self.lifecycle.state() != LifecycleState::Disconnected {
                    warn!("signaling closed by the server");
                    self.connection_lost();
                }
            }
            Some(SignalingEvent::StateChanged { socket, state }) => {
                debug!(%socket, %state, "socket state");
            }
            Some(SignalingEvent::ConnectionLost {
                socket: SocketKind::Reliable,
            }) => {
                error!("signaling connection lost");
                self.connection_lost();
            }
            Some(SignalingEvent::ConnectionLost { socket }) => {
                error!(%socket, "socket lost, its traffic is dropped until logout");
            }
            Some(SignalingEvent::Message { message, .. }) => self.handle_message(message),
        }
    }

    fn handle_message(&mut self, message: Decoded) {
        match message {
            Decoded::Signaling(envelope) => self.handle_envelope(envelope),
            Decoded::Frame(frame) => {
                let delivery = self.registry.accept_relay(frame);
                self.deliver(delivery);
            }
            Decoded::Extension { tag, .. } => debug!(tag, "extension message ignored"),
            other => debug!(?other, "message ignored"),
        }
    }

    fn handle_envelope(&mut self, envelope: SignalingEnvelope) {
        match &envelope.message {
            SignalingMessage::HandshakeAck { peer } => {
                self.handshake_deadline = None;
                let effects = self.lifecycle.on_handshake_ack(peer.clone());
                self.apply(effects);
                let peer = self.registry.local().clone();
                self.finish_connects(|| Ok(peer.clone()));
            }
            SignalingMessage::TokenRefresh(token) => self.publish_token(token.clone()),
            SignalingMessage::StatusChange(status) => {
                let effects = self.lifecycle.on_status(status.clone());
                self.apply(effects);
            }
            _ => match self.registry.handle_signal(envelope) {
                Ok(delivery) => self.deliver(delivery),
                Err(err) => warn!(%err, "signal rejected"),
            },
        }
    }

    fn handle_peer_event(&mut self, peer: &PeerId, event: PeerEvent) {
        match self.registry.handle_peer_event(peer, event) {
            Ok(delivery) => self.deliver(delivery),
            Err(err) => warn!(%peer, %err, "peer event failed"),
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        let effects = match completion {
            Completion::Credentials(result) => {
                self.on_credentials(result);
                return;
            }
            Completion::Identity(result) => {
                self.lifecycle.on_identity(result.map_err(|err| err.to_string()))
            }
            Completion::Status(Ok(status)) => self.lifecycle.on_status(status.status),
            Completion::Status(Err(err)) => {
                warn!(%err, "status unavailable");
                return;
            }
            Completion::Join(result) => {
                self.lifecycle.on_join_result(result.map_err(|err| err.to_string()))
            }
            Completion::Libraries(Ok(libraries)) => self.lifecycle.on_libraries(&libraries),
            Completion::Libraries(Err(err)) => {
                warn!(%err, "library list unavailable");
                return;
            }
            Completion::LibraryApproval {
                libraries,
                approved,
            } => {
                info!(count = libraries.len(), approved, "library download answered");
                vec![Effect::Notify(ClientEvent::LibrariesApproved {
                    libraries,
                    approved,
                })]
            }
        };
        self.apply(effects);
    }

    fn on_credentials(&mut self, result: Result<Credentials, SessionError>) {
        if self.lifecycle.state() != LifecycleState::Connecting || self.signaling.is_some() {
            debug!("stale credentials ignored");
            return;
        }
        let credentials = match result {
            Ok(credentials) => credentials,
            Err(err) => {
                error!(%err, "credentials unavailable");
                self.finish_connects(|| Err(err.clone().into()));
                self.connection_lost();
                return;
            }
        };
        info!(user = %credentials.user, "credentials loaded");
        if let Some(token) = credentials.token {
            self.tokens.publish(token);
        }
        let started = SignalingChannel::start(
            self.connector.clone(),
            self.config.signaling.clone(),
            self.codec.clone(),
            &self.handshake(),
        );
        match started {
            Ok((channel, events)) => {
                self.signaling = Some(channel);
                self.signaling_events = Some(events);
            }
            Err(err) => {
                error!(%err, "signaling failed to start");
                let reason = err.to_string();
                self.finish_connects(|| Err(TandemError::Config(reason.clone())));
                self.connection_lost();
            }
        }
    }

    fn on_tick(&mut self) {
        if self
            .handshake_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            self.handshake_deadline = None;
            let timeout = self.config.signaling.handshake_timeout;
            self.finish_connects(|| Err(TandemError::HandshakeTimeout(timeout)));
            let effects = self.lifecycle.on_handshake_timeout();
            self.apply(effects);
        }
        if !self.guards.is_empty() {
            let state = self.snapshot();
            let resolved = self.guards.check(&state);
            if resolved > 0 {
                debug!(resolved, "guards resolved");
            }
        }
        self.scheduler.record_tick_end();
    }

    // -- effects ------------------------------------------------------------

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::OpenSignaling => {
                    self.handshake_deadline =
                        Some(Instant::now() + self.config.signaling.handshake_timeout);
                    let identity = Arc::clone(&self.identity);
                    self.spawn(async move { Completion::Credentials(identity.credentials().await) });
                }
                Effect::ShutdownSignaling => self.shutdown_signaling(),
                Effect::AssignLocalPeer(peer) => {
                    self.registry.set_local(peer);
                    self.refresh_handshake();
                }
                Effect::FetchIdentity => {
                    let api = self.api.clone();
                    self.spawn(async move { Completion::Identity(api.identity().await) });
                }
                Effect::FetchStatus => {
                    let api = self.api.clone();
                    self.spawn(async move { Completion::Status(api.status().await) });
                }
                Effect::Join => {
                    let api = self.api.clone();
                    self.spawn(async move { Completion::Join(api.join().await) });
                }
                Effect::PublishToken(token) => self.publish_token(token),
                Effect::OpenServerSession => self.open_server_session(),
                Effect::FetchLibraries => {
                    let api = self.api.clone();
                    self.spawn(async move { Completion::Libraries(api.libraries().await) });
                }
                Effect::RequestLibraryApproval(libraries) => {
                    let identity = Arc::clone(&self.identity);
                    self.spawn(async move {
                        let approved = identity.approve_library_download(&libraries).await;
                        Completion::LibraryApproval {
                            libraries,
                            approved,
                        }
                    });
                }
                Effect::CloseAllPeers => {
                    for event in self.registry.close_all() {
                        self.publish(ClientEvent::Session(event));
                    }
                }
                Effect::PostLogout => {
                    let api = self.api.clone();
                    let token = self.tokens.current();
                    tokio::spawn(async move {
                        match tokio::time::timeout(LOGOUT_TIMEOUT, api.logout(token.as_ref())).await {
                            Ok(Ok(())) => info!("logged out"),
                            Ok(Err(err)) => warn!(%err, "logout request failed"),
                            Err(_) => warn!("logout request timed out"),
                        }
                    });
                }
                Effect::Notify(event) => self.publish(event),
            }
        }
    }

    fn spawn<F>(&self, work: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let completions = self.completions_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let _ = completions.send((epoch, work.await));
        });
    }

    fn open_server_session(&mut self) {
        let server = PeerId::server();
        if let Err(err) = self.registry.connect(&server) {
            error!(%err, "server session failed");
            return;
        }
        for spec in self.config.default_channels.clone() {
            let label = spec.label.clone();
            if let Err(err) = self.registry.request_channel(&server, spec) {
                warn!(%label, %err, "default channel not requested");
            }
        }
    }

    fn publish_token(&mut self, token: Token) {
        if self.tokens.publish(token) {
            self.refresh_handshake();
        }
    }

    /// The handshake for the next (re)connection.
    fn handshake(&self) -> SignalingEnvelope {
        SignalingEnvelope::new(
            self.registry.local().clone(),
            PeerId::server(),
            SignalingMessage::Handshake {
                client: self.config.client_name.clone(),
                token: self.tokens.current().map(|token| token.value),
            },
        )
    }

    fn refresh_handshake(&self) {
        if let Some(channel) = &self.signaling {
            channel.set_handshake(&self.handshake());
        }
    }

    fn shutdown_signaling(&mut self) {
        self.epoch += 1;
        self.handshake_deadline = None;
        self.signaling_events = None;
        if let Some(mut channel) = self.signaling.take() {
            tokio::spawn(async move { channel.shutdown().await });
        }
    }

    fn connection_lost(&mut self) {
        self.handshake_deadline = None;
        self.finish_connects(|| Err(TandemError::ConnectionLost));
        let effects = self.lifecycle.on_connection_lost();
        self.apply(effects);
    }

    async fn stop(&mut self) {
        info!("session loop stopping");
        self.finish_connects(|| Err(TandemError::Stopped));
        for event in self.registry.close_all() {
            self.publish(ClientEvent::Session(event));
        }
        self.signaling_events = None;
        if let Some(mut channel) = self.signaling.take() {
            channel.shutdown().await;
        }
        self.guards.clear();
    }

    // -- outputs ------------------------------------------------------------

    /// Sends everything the registry queued and publishes its events.
    fn flush(&mut self) {
        for envelope in self.registry.take_outgoing() {
            self.send_signal(SocketKind::Reliable, envelope);
        }
        while let Ok(frame) = self.relay_frames.try_recv() {
            let socket = if frame.reliable {
                SocketKind::Reliable
            } else {
                SocketKind::LowLatency
            };
            let target = match frame.targets.len() {
                1 => frame.targets.iter().next().cloned().unwrap_or_else(PeerId::server),
                _ => PeerId::server(),
            };
            let envelope = SignalingEnvelope::new(
                self.registry.local().clone(),
                target,
                SignalingMessage::Relay(frame),
            );
            self.send_signal(socket, envelope);
        }
        for event in self.registry.take_events() {
            self.publish(ClientEvent::Session(event));
        }
    }

    fn send_signal(&self, socket: SocketKind, envelope: SignalingEnvelope) {
        let Some(channel) = &self.signaling else {
            warn!(kind = envelope.message.name(), "no signaling connection, signal dropped");
            return;
        };
        if let Err(err) = channel.send_envelope(socket, envelope) {
            warn!(%socket, %err, "signal dropped");
        }
    }

    fn deliver(&mut self, delivery: Option<Delivery>) {
        if let Some(delivery) = delivery {
            self.payloads
                .on_payload(&delivery.peer, delivery.category, &delivery.payload);
        }
    }

    fn publish(&mut self, event: ClientEvent) {
        debug!(?event, "client event");
        self.subscribers.publish(&event);
    }

    fn finish_connects(&mut self, outcome: impl Fn() -> Result<PeerId, TandemError>) {
        for reply in self.pending_connects.drain(..) {
            let _ = reply.send(outcome());
        }
    }

    fn snapshot(&self) -> ClientState {
        let mut peers = BTreeSet::new();
        let mut open_channels = BTreeSet::new();
        for peer in self.registry.peer_ids() {
            peers.insert(peer.clone());
            let Some(session) = self.registry.get(peer) else {
                continue;
            };
            for channel in session.channels() {
                if channel.state() == ChannelState::Open {
                    open_channels.insert((peer.clone(), channel.label().to_owned()));
                }
            }
        }
        ClientState {
            lifecycle: self.lifecycle.state(),
            local_peer: self.lifecycle.local_peer().cloned(),
            session_id: self.lifecycle.session_id().map(str::to_owned),
            peers,
            open_channels,
        }
    }
}

/// The next signaling event, or never when signaling is not running.
async fn next_signaling(
    events: &mut Option<mpsc::UnboundedReceiver<SignalingEvent>>,
) -> Option<SignalingEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
