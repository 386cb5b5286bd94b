//! The per-peer negotiation state machine and channel set.
//!
//! ```text
//!          create_offer            on_answer
//!  Idle ───────────────► LocalSet ───────────┐
//!    │                                       ▼
//!    │  on_offer (answer emitted)         BothSet ──(transport connected)──► Ready
//!    └────────────────────────────────────►  ▲                                 │
//!                                            │                                 │
//!        any state ──── close() / transport disconnected ────► Closed ◄────────┘
//! ```
//!
//! Renegotiating a `Ready` session, from either side, lands back in
//! `Ready` once both descriptions are applied again.
//!
//! A `PeerSession` never performs I/O itself. Outbound signaling is queued
//! in an outbox ([`PeerSession::take_outgoing`]) and lifecycle changes in
//! an event list ([`PeerSession::take_events`]); the session loop drains
//! both after every call. Transport callbacks come back as [`PeerEvent`]s.

use std::sync::Arc;

use tandem_protocol::{
    ChannelSpec, IceCandidate, PayloadCategory, PeerId, SignalingEnvelope, SignalingMessage,
    WireCodec, WireMessage,
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, ChannelSink, ChannelState};
use crate::relay::{DataChannel, Delivery, DirectSink, FrameSink, RelaySink};
use crate::SessionError;

// ---------------------------------------------------------------------------
// Peer transport seam
// ---------------------------------------------------------------------------

/// The local end of a peer-to-peer transport (an RTC peer connection or
/// equivalent).
///
/// Calls are synchronous and cheap; anything the transport learns later
/// (candidates, channel readiness, data) is reported through the
/// [`PeerEventSink`] it was created with.
pub trait PeerConnector: Send {
    /// Produces a local offer description.
    fn create_offer(&mut self) -> Result<String, SessionError>;

    /// Produces a local answer to the applied remote offer.
    fn create_answer(&mut self) -> Result<String, SessionError>;

    /// Applies a local description.
    fn set_local_description(&mut self, sdp: &str) -> Result<(), SessionError>;

    /// Applies a remote description.
    fn set_remote_description(&mut self, sdp: &str) -> Result<(), SessionError>;

    /// Discards any applied descriptions, returning to a stable state.
    fn rollback(&mut self) -> Result<(), SessionError>;

    /// Applies a remote connectivity candidate.
    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), SessionError>;

    /// Opens a data channel. Readiness arrives later as
    /// [`PeerEvent::ChannelOpened`].
    fn open_channel(&mut self, spec: &ChannelSpec) -> Result<Box<dyn DataChannel>, SessionError>;

    /// Tears the transport down.
    fn close(&mut self);
}

/// Creates [`PeerConnector`]s. When none is configured every peer is
/// reached through the relay.
pub trait PeerConnectorFactory: Send + Sync {
    /// Creates the transport for `peer`.
    fn connect(&self, peer: &PeerId, events: PeerEventSink)
        -> Result<Box<dyn PeerConnector>, SessionError>;
}

/// Something the peer transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local candidate to send to the remote.
    LocalCandidate(IceCandidate),
    /// Connectivity established.
    Connected,
    /// A data channel is ready.
    ChannelOpened {
        /// Channel label.
        label: String,
    },
    /// A data channel went away.
    ChannelClosed {
        /// Channel label.
        label: String,
    },
    /// Bytes arrived on a data channel.
    Data {
        /// Channel label.
        label: String,
        /// The raw message.
        bytes: Vec<u8>,
    },
    /// Candidate exchange failed. The session is held open, degraded.
    IceFailed,
    /// The transport is gone for good.
    Disconnected,
}

/// Marshals transport callbacks for one peer onto the session loop.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    peer: PeerId,
    tx: mpsc::UnboundedSender<(PeerId, PeerEvent)>,
}

impl PeerEventSink {
    /// A sink tagging events with `peer`.
    pub fn new(peer: PeerId, tx: mpsc::UnboundedSender<(PeerId, PeerEvent)>) -> Self {
        Self { peer, tx }
    }

    /// The peer these events belong to.
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Queues an event. Returns `false` once the session loop is gone.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx.send((self.peer.clone(), event)).is_ok()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Which descriptions have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// Our offer is applied and outstanding.
    LocalSet,
    /// The remote description is applied, ours is not.
    RemoteSet,
    /// Both applied; candidates flow.
    BothSet,
}

/// Lifecycle of a [`PeerSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Nothing negotiated yet.
    Idle,
    /// Offer/answer in progress.
    Negotiating(Negotiation),
    /// Transport connected (or relay-only).
    Ready,
    /// Terminal.
    Closed,
}

/// Lifecycle notifications drained by the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The peer is usable.
    PeerReady {
        /// The peer.
        peer: PeerId,
    },
    /// Candidate exchange failed; the peer is held open.
    PeerDegraded {
        /// The peer.
        peer: PeerId,
    },
    /// The peer session closed.
    PeerClosed {
        /// The peer.
        peer: PeerId,
    },
    /// A channel opened.
    ChannelOpened {
        /// The peer.
        peer: PeerId,
        /// Channel label.
        label: String,
    },
    /// A channel closed.
    ChannelClosed {
        /// The peer.
        peer: PeerId,
        /// Channel label.
        label: String,
    },
}

// ---------------------------------------------------------------------------
// PeerSession
// ---------------------------------------------------------------------------

/// Negotiated connection state to one remote peer, plus its channels.
pub struct PeerSession {
    local: PeerId,
    remote: PeerId,
    state: PeerState,
    connector: Option<Box<dyn PeerConnector>>,
    frames: Arc<dyn FrameSink>,
    codec: WireCodec,
    channels: Vec<Channel>,
    pending_candidates: Vec<IceCandidate>,
    degraded: bool,
    transport_up: bool,
    outbox: Vec<SignalingEnvelope>,
    events: Vec<SessionEvent>,
}

impl PeerSession {
    /// A relay-only session. It is ready at once: there is nothing to
    /// negotiate.
    pub fn relay(local: PeerId, remote: PeerId, frames: Arc<dyn FrameSink>, codec: WireCodec) -> Self {
        let mut session = Self::build(local, remote, None, frames, codec);
        session.state = PeerState::Ready;
        session.events.push(SessionEvent::PeerReady {
            peer: session.remote.clone(),
        });
        session
    }

    /// A session over a peer transport.
    pub fn direct(
        local: PeerId,
        remote: PeerId,
        connector: Box<dyn PeerConnector>,
        frames: Arc<dyn FrameSink>,
        codec: WireCodec,
    ) -> Self {
        Self::build(local, remote, Some(connector), frames, codec)
    }

    fn build(
        local: PeerId,
        remote: PeerId,
        connector: Option<Box<dyn PeerConnector>>,
        frames: Arc<dyn FrameSink>,
        codec: WireCodec,
    ) -> Self {
        Self {
            local,
            remote,
            state: PeerState::Idle,
            connector,
            frames,
            codec,
            channels: Vec::new(),
            pending_candidates: Vec::new(),
            degraded: false,
            transport_up: false,
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    // -- accessors ----------------------------------------------------------

    /// The remote peer.
    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    /// Current state.
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// `true` if there is no peer transport.
    pub fn is_relay_only(&self) -> bool {
        self.connector.is_none()
    }

    /// `true` after a candidate-exchange failure, until reconnected or closed.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Remote candidates waiting for both descriptions.
    pub fn buffered_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// The channel with `label`, in any state.
    pub fn channel(&self, label: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.label() == label)
    }

    /// All channels in creation order.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    /// Drains outbound signaling.
    pub fn take_outgoing(&mut self) -> Vec<SignalingEnvelope> {
        std::mem::take(&mut self.outbox)
    }

    /// Drains lifecycle events.
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    // -- negotiation --------------------------------------------------------

    /// Starts (or restarts) offer/answer as the offerer.
    pub fn create_offer(&mut self) -> Result<(), SessionError> {
        if self.state == PeerState::Closed {
            return Ok(());
        }
        let Some(connector) = self.connector.as_mut() else {
            debug!(peer = %self.remote, "relay-only peer, no offer needed");
            return Ok(());
        };
        let sdp = connector.create_offer()?;
        connector.set_local_description(&sdp)?;
        self.state = match self.state {
            PeerState::Negotiating(Negotiation::RemoteSet) => self.settled_state(),
            _ => PeerState::Negotiating(Negotiation::LocalSet),
        };
        debug!(peer = %self.remote, state = ?self.state, "offer created");
        self.emit(SignalingMessage::Offer { sdp });
        self.apply_buffered_candidates();
        Ok(())
    }

    /// Handles a remote offer: apply it, then answer.
    ///
    /// If our own offer is outstanding (glare), the peer with the smaller
    /// id rolls back and answers; the other ignores the remote offer.
    pub fn on_offer(&mut self, sdp: &str) -> Result<(), SessionError> {
        if self.state == PeerState::Closed {
            return Ok(());
        }
        if self.connector.is_none() {
            warn!(peer = %self.remote, "offer for relay-only peer ignored");
            return Ok(());
        }
        if self.offer_outstanding() {
            if !self.is_polite() {
                debug!(peer = %self.remote, "offer collision, keeping our offer");
                return Ok(());
            }
            debug!(peer = %self.remote, "offer collision, rolling back to answer");
            self.connector_mut()?.rollback()?;
            self.state = PeerState::Idle;
        }

        let connector = self.connector_mut()?;
        connector.set_remote_description(sdp)?;
        self.state = PeerState::Negotiating(Negotiation::RemoteSet);

        let connector = self.connector_mut()?;
        let answer = connector.create_answer()?;
        connector.set_local_description(&answer)?;
        self.emit(SignalingMessage::Answer { sdp: answer });
        self.state = self.settled_state();
        self.apply_buffered_candidates();
        Ok(())
    }

    /// Handles a remote answer to our outstanding offer.
    ///
    /// An answer nobody asked for asks the remote to start over.
    pub fn on_answer(&mut self, sdp: &str) -> Result<(), SessionError> {
        if self.state == PeerState::Closed {
            return Ok(());
        }
        if !self.offer_outstanding() {
            warn!(peer = %self.remote, state = ?self.state, "answer without a pending offer, requesting restart");
            self.emit(SignalingMessage::RestartNegotiation);
            return Ok(());
        }
        self.connector_mut()?.set_remote_description(sdp)?;
        self.state = self.settled_state();
        debug!(peer = %self.remote, state = ?self.state, "answer applied");
        self.apply_buffered_candidates();
        Ok(())
    }

    /// Handles a remote candidate: applied when both descriptions are
    /// set, buffered otherwise.
    pub fn on_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), SessionError> {
        if self.state == PeerState::Closed || self.connector.is_none() {
            trace!(peer = %self.remote, "candidate ignored");
            return Ok(());
        }
        if self.descriptions_applied() {
            self.connector_mut()?.add_ice_candidate(&candidate)?;
        } else {
            trace!(peer = %self.remote, buffered = self.pending_candidates.len() + 1, "buffering candidate");
            self.pending_candidates.push(candidate);
        }
        Ok(())
    }

    /// Forwards a locally discovered candidate to the remote.
    pub fn on_local_candidate(&mut self, candidate: IceCandidate) {
        if self.state != PeerState::Closed {
            self.emit(SignalingMessage::IceCandidate(candidate));
        }
    }

    /// The remote asked us to start over: drop both descriptions and any
    /// buffered candidates, then offer again.
    pub fn on_restart_negotiation(&mut self) -> Result<(), SessionError> {
        if self.state == PeerState::Closed || self.connector.is_none() {
            return Ok(());
        }
        info!(peer = %self.remote, "restarting negotiation");
        if let Err(err) = self.connector_mut()?.rollback() {
            warn!(peer = %self.remote, %err, "rollback failed");
        }
        self.pending_candidates.clear();
        self.state = PeerState::Idle;
        self.create_offer()
    }

    fn apply_buffered_candidates(&mut self) {
        if !self.descriptions_applied() || self.pending_candidates.is_empty() {
            return;
        }
        let Some(connector) = self.connector.as_mut() else {
            return;
        };
        debug!(peer = %self.remote, count = self.pending_candidates.len(), "applying buffered candidates");
        for candidate in self.pending_candidates.drain(..) {
            if let Err(err) = connector.add_ice_candidate(&candidate) {
                warn!(peer = %self.remote, %err, "buffered candidate rejected");
            }
        }
    }

    // -- transport events ---------------------------------------------------

    /// Applies a transport callback. Returns an application payload when
    /// one arrived.
    pub fn handle_event(&mut self, event: PeerEvent) -> Result<Option<Delivery>, SessionError> {
        if self.state == PeerState::Closed {
            trace!(peer = %self.remote, ?event, "event for closed peer ignored");
            return Ok(None);
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => self.on_local_candidate(candidate),
            PeerEvent::Connected => {
                if self.descriptions_applied() {
                    self.transport_up = true;
                    self.state = PeerState::Ready;
                    self.degraded = false;
                    info!(peer = %self.remote, "peer transport connected");
                    self.events.push(SessionEvent::PeerReady {
                        peer: self.remote.clone(),
                    });
                }
            }
            PeerEvent::ChannelOpened { label } => self.on_channel_opened(&label)?,
            PeerEvent::ChannelClosed { label } => self.on_channel_closed(&label),
            PeerEvent::Data { label, bytes } => {
                return Ok(self.unwrap_data(&label, &bytes));
            }
            PeerEvent::IceFailed => {
                if !self.degraded {
                    warn!(peer = %self.remote, "candidate exchange failed, session degraded");
                    self.degraded = true;
                    self.events.push(SessionEvent::PeerDegraded {
                        peer: self.remote.clone(),
                    });
                }
            }
            PeerEvent::Disconnected => {
                info!(peer = %self.remote, "peer transport disconnected");
                self.close();
            }
        }
        Ok(None)
    }

    fn unwrap_data(&self, label: &str, bytes: &[u8]) -> Option<Delivery> {
        match self.codec.decode::<WireMessage>(bytes) {
            Ok(WireMessage::Frame(frame)) => Some(Delivery::from_frame(frame)),
            Ok(other) => {
                warn!(peer = %self.remote, label, kind = ?other, "non-frame message on data channel");
                None
            }
            Err(err) => {
                warn!(peer = %self.remote, label, %err, "undecodable data channel message");
                None
            }
        }
    }

    // -- channels -----------------------------------------------------------

    /// Returns the live channel for `spec.label`, or creates one in
    /// Opening and announces it to the remote.
    pub fn request_channel(&mut self, spec: ChannelSpec) -> Result<(), SessionError> {
        if self.state == PeerState::Closed {
            return Err(SessionError::ChannelClosed {
                peer: self.remote.clone(),
                label: spec.label,
            });
        }
        if let Some(existing) = self.live_channel(&spec.label) {
            debug!(peer = %self.remote, label = %spec.label, state = ?existing.state(), "reusing channel");
            return Ok(());
        }
        let channel = self.create_channel(spec.clone())?;
        self.insert_channel(channel);
        debug!(peer = %self.remote, label = %spec.label, "channel requested");
        self.emit(SignalingMessage::ChannelAnnounce(spec));
        Ok(())
    }

    /// Handles a remote `ChannelAnnounce`.
    ///
    /// - A new label creates the matching channel. Relay channels open at
    ///   once and echo one announce back as confirmation.
    /// - An announce for our own Opening relay channel is that
    ///   confirmation and opens it.
    /// - An announce for an Open channel is ignored; the existing channel
    ///   and anything in flight on it are kept.
    pub fn on_channel_announce(&mut self, spec: ChannelSpec) -> Result<(), SessionError> {
        if self.state == PeerState::Closed {
            return Ok(());
        }
        if let Some(index) = self.live_index(&spec.label) {
            let channel = &self.channels[index];
            match (channel.state(), channel.is_relay()) {
                (ChannelState::Opening, true) => {
                    debug!(peer = %self.remote, label = %spec.label, "relay channel confirmed");
                    self.open_channel_at(index)?;
                }
                (state, _) => {
                    debug!(peer = %self.remote, label = %spec.label, ?state, "re-announce ignored");
                }
            }
            return Ok(());
        }

        let channel = self.create_channel(spec.clone())?;
        let relay = channel.is_relay();
        let index = self.insert_channel(channel);
        debug!(peer = %self.remote, label = %spec.label, relay, "channel announced by remote");
        if relay {
            self.emit(SignalingMessage::ChannelAnnounce(spec));
            self.open_channel_at(index)?;
        }
        Ok(())
    }

    /// The transport confirmed the channel: open it and flush.
    pub fn on_channel_opened(&mut self, label: &str) -> Result<(), SessionError> {
        match self.live_index(label) {
            Some(index) => self.open_channel_at(index),
            None => {
                warn!(peer = %self.remote, label, "open confirmation for unknown channel");
                Ok(())
            }
        }
    }

    /// The transport closed the channel.
    pub fn on_channel_closed(&mut self, label: &str) {
        if let Some(index) = self.live_index(label) {
            if self.channels[index].close() {
                self.events.push(SessionEvent::ChannelClosed {
                    peer: self.remote.clone(),
                    label: label.to_owned(),
                });
            }
        }
    }

    /// Sends on the first channel carrying `reliable`/`category` traffic.
    ///
    /// Channels are never created here; with no match the payload is
    /// dropped and [`SessionError::NoMatchingChannel`] returned.
    pub fn send(
        &mut self,
        reliable: bool,
        category: PayloadCategory,
        payload: Vec<u8>,
    ) -> Result<(), SessionError> {
        let index = self
            .channels
            .iter()
            .position(|c| c.matches(reliable, category) && c.state() != ChannelState::Closed)
            .or_else(|| self.channels.iter().position(|c| c.matches(reliable, category)));
        match index {
            Some(index) => self.channels[index].send(payload),
            None => {
                warn!(peer = %self.remote, reliable, %category, "no matching channel, payload dropped");
                Err(SessionError::NoMatchingChannel {
                    peer: self.remote.clone(),
                    reliable,
                    category,
                })
            }
        }
    }

    /// Closes every channel (discarding queued sends), drops buffered
    /// candidates, and closes the transport.
    pub fn close(&mut self) {
        if self.state == PeerState::Closed {
            return;
        }
        for channel in &mut self.channels {
            if channel.close() {
                self.events.push(SessionEvent::ChannelClosed {
                    peer: self.remote.clone(),
                    label: channel.label().to_owned(),
                });
            }
        }
        self.pending_candidates.clear();
        if let Some(connector) = self.connector.as_mut() {
            connector.close();
        }
        self.transport_up = false;
        self.state = PeerState::Closed;
        info!(peer = %self.remote, "peer session closed");
        self.events.push(SessionEvent::PeerClosed {
            peer: self.remote.clone(),
        });
    }

    // -- helpers ------------------------------------------------------------

    fn emit(&mut self, message: SignalingMessage) {
        trace!(peer = %self.remote, kind = message.name(), "queue signaling");
        self.outbox.push(SignalingEnvelope::new(
            self.local.clone(),
            self.remote.clone(),
            message,
        ));
    }

    fn connector_mut(&mut self) -> Result<&mut Box<dyn PeerConnector>, SessionError> {
        self.connector
            .as_mut()
            .ok_or_else(|| SessionError::Transport(format!("{} has no peer transport", self.remote)))
    }

    fn offer_outstanding(&self) -> bool {
        self.state == PeerState::Negotiating(Negotiation::LocalSet)
    }

    /// Where negotiation lands once both descriptions are applied.
    /// Renegotiating over a live transport goes straight back to `Ready`.
    fn settled_state(&self) -> PeerState {
        if self.transport_up {
            PeerState::Ready
        } else {
            PeerState::Negotiating(Negotiation::BothSet)
        }
    }

    fn descriptions_applied(&self) -> bool {
        matches!(
            self.state,
            PeerState::Negotiating(Negotiation::BothSet) | PeerState::Ready
        )
    }

    fn is_polite(&self) -> bool {
        self.local < self.remote
    }

    fn live_index(&self, label: &str) -> Option<usize> {
        self.channels
            .iter()
            .position(|c| c.label() == label && c.state() != ChannelState::Closed)
    }

    fn live_channel(&self, label: &str) -> Option<&Channel> {
        self.live_index(label).map(|i| &self.channels[i])
    }

    fn create_channel(&mut self, spec: ChannelSpec) -> Result<Channel, SessionError> {
        let sink: Box<dyn ChannelSink> = match self.connector.as_mut() {
            None => Box::new(RelaySink::new(
                self.local.clone(),
                self.remote.clone(),
                spec.clone(),
                Arc::clone(&self.frames),
            )),
            Some(connector) => {
                let data = connector.open_channel(&spec)?;
                Box::new(DirectSink::new(
                    self.local.clone(),
                    self.remote.clone(),
                    spec.clone(),
                    data,
                ))
            }
        };
        Ok(Channel::new(self.remote.clone(), spec, sink))
    }

    /// Replaces a closed channel with the same label, or appends.
    fn insert_channel(&mut self, channel: Channel) -> usize {
        match self.channels.iter().position(|c| c.label() == channel.label()) {
            Some(index) => {
                self.channels[index] = channel;
                index
            }
            None => {
                self.channels.push(channel);
                self.channels.len() - 1
            }
        }
    }

    fn open_channel_at(&mut self, index: usize) -> Result<(), SessionError> {
        let channel = &mut self.channels[index];
        if channel.state() != ChannelState::Opening {
            return Ok(());
        }
        let result = channel.open();
        let label = channel.label().to_owned();
        self.events.push(SessionEvent::ChannelOpened {
            peer: self.remote.clone(),
            label,
        });
        result
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("relay_only", &self.connector.is_none())
            .field("degraded", &self.degraded)
            .field("channels", &self.channels)
            .finish()
    }
}
