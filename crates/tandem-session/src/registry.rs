//! The set of live peer sessions and the signaling router in front of it.
//!
//! Owned by the session loop, like everything else in this crate; it is
//! a plain `BTreeMap`, not a concurrent map.

use std::collections::BTreeMap;
use std::sync::Arc;

use tandem_protocol::{
    ChannelSpec, Frame, PayloadCategory, PeerId, SignalingEnvelope, SignalingMessage, WireCodec,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelState;
use crate::peer::{PeerConnectorFactory, PeerEvent, PeerEventSink, PeerSession, SessionEvent};
use crate::relay::{Delivery, FrameSink};
use crate::SessionError;

/// Every peer session, keyed by remote id.
///
/// Creation is idempotent: however many triggers race to reach a peer
/// (a local connect, a remote offer, a candidate), they all land on the
/// same [`PeerSession`].
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, PeerSession>,
    maker: PeerMaker,
    outbox: Vec<SignalingEnvelope>,
    // Final events of sessions already removed.
    retired: Vec<SessionEvent>,
}

/// Everything needed to build a new [`PeerSession`].
struct PeerMaker {
    local: PeerId,
    factory: Option<Arc<dyn PeerConnectorFactory>>,
    frames: Arc<dyn FrameSink>,
    codec: WireCodec,
    peer_events: mpsc::UnboundedSender<(PeerId, PeerEvent)>,
}

impl PeerMaker {
    /// The server and, without a connector factory, every other peer get
    /// a relay-only session. A factory failure falls back to relay.
    fn create(&self, peer: &PeerId) -> PeerSession {
        let relay = || {
            PeerSession::relay(
                self.local.clone(),
                peer.clone(),
                Arc::clone(&self.frames),
                self.codec.clone(),
            )
        };
        let factory = match &self.factory {
            Some(factory) if !peer.is_server() => factory,
            _ => {
                info!(%peer, "peer session created (relay)");
                return relay();
            }
        };
        let sink = PeerEventSink::new(peer.clone(), self.peer_events.clone());
        match factory.connect(peer, sink) {
            Ok(connector) => {
                info!(%peer, "peer session created (direct)");
                PeerSession::direct(
                    self.local.clone(),
                    peer.clone(),
                    connector,
                    Arc::clone(&self.frames),
                    self.codec.clone(),
                )
            }
            Err(err) => {
                warn!(%peer, %err, "peer transport unavailable, using relay");
                relay()
            }
        }
    }
}

impl PeerRegistry {
    /// Creates an empty registry.
    ///
    /// Transport callbacks for created peers are sent to `peer_events`.
    /// Without a `factory` every peer is relay-only.
    pub fn new(
        frames: Arc<dyn FrameSink>,
        factory: Option<Arc<dyn PeerConnectorFactory>>,
        codec: WireCodec,
        peer_events: mpsc::UnboundedSender<(PeerId, PeerEvent)>,
    ) -> Self {
        Self {
            peers: BTreeMap::new(),
            maker: PeerMaker {
                local: PeerId::unassigned(),
                factory,
                frames,
                codec,
                peer_events,
            },
            outbox: Vec::new(),
            retired: Vec::new(),
        }
    }

    /// Our own id, once the server has assigned one.
    pub fn local(&self) -> &PeerId {
        &self.maker.local
    }

    /// Records the id the server assigned to us.
    pub fn set_local(&mut self, local: PeerId) {
        info!(%local, "local peer id assigned");
        self.maker.local = local;
    }

    /// The session for `peer`, if any.
    pub fn get(&self, peer: &PeerId) -> Option<&PeerSession> {
        self.peers.get(peer)
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// `true` if there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Ids of every session.
    pub fn peer_ids(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }

    /// State of the channel `label` to `peer`, if it exists.
    pub fn channel_state(&self, peer: &PeerId, label: &str) -> Option<ChannelState> {
        self.peers.get(peer)?.channel(label).map(|c| c.state())
    }

    /// Returns the session for `peer`, creating it on first reference.
    pub fn get_or_create(&mut self, peer: &PeerId) -> &mut PeerSession {
        self.peers
            .entry(peer.clone())
            .or_insert_with(|| self.maker.create(peer))
    }

    /// Local decision to reach `peer`: ensures a session and, for a fresh
    /// direct session, starts the offer.
    pub fn connect(&mut self, peer: &PeerId) -> Result<(), SessionError> {
        let session = self.get_or_create(peer);
        if session.state() == crate::PeerState::Idle && !session.is_relay_only() {
            session.create_offer()?;
        }
        self.collect(peer);
        Ok(())
    }

    /// Routes one inbound signaling envelope to its peer session.
    ///
    /// Returns the application payload for relayed frames. Messages that
    /// are not peer-scoped (tokens, status, handshakes) are ignored here.
    pub fn handle_signal(
        &mut self,
        envelope: SignalingEnvelope,
    ) -> Result<Option<Delivery>, SessionError> {
        let SignalingEnvelope { source, message, .. } = envelope;
        debug!(from = %source, kind = message.name(), "signal");
        let result = match message {
            SignalingMessage::Offer { sdp } => self.get_or_create(&source).on_offer(&sdp),
            SignalingMessage::IceCandidate(candidate) => {
                self.get_or_create(&source).on_ice_candidate(candidate)
            }
            SignalingMessage::ChannelAnnounce(spec) => {
                self.get_or_create(&source).on_channel_announce(spec)
            }
            SignalingMessage::PeerJoin => {
                self.get_or_create(&source);
                Ok(())
            }
            SignalingMessage::Answer { sdp } => match self.peers.get_mut(&source) {
                Some(session) => session.on_answer(&sdp),
                None => {
                    warn!(peer = %source, "answer from unknown peer, requesting restart");
                    self.outbox.push(SignalingEnvelope::new(
                        self.maker.local.clone(),
                        source.clone(),
                        SignalingMessage::RestartNegotiation,
                    ));
                    Ok(())
                }
            },
            SignalingMessage::RestartNegotiation => {
                self.get_or_create(&source).on_restart_negotiation()
            }
            SignalingMessage::PeerLeave | SignalingMessage::ConnectionClose => {
                self.remove(&source);
                Ok(())
            }
            SignalingMessage::Relay(frame) => {
                if frame.source != source && !source.is_server() {
                    warn!(from = %source, claimed = %frame.source, "relayed frame with forged source dropped");
                    return Ok(None);
                }
                return Ok(self.accept_relay(frame));
            }
            other => {
                debug!(kind = other.name(), "not a peer message");
                Ok(())
            }
        };
        self.collect(&source);
        result.map(|()| None)
    }

    /// Applies a transport callback for `peer`.
    pub fn handle_peer_event(
        &mut self,
        peer: &PeerId,
        event: PeerEvent,
    ) -> Result<Option<Delivery>, SessionError> {
        let Some(session) = self.peers.get_mut(peer) else {
            debug!(%peer, ?event, "event for removed peer dropped");
            return Ok(None);
        };
        let delivery = session.handle_event(event);
        self.collect(peer);
        delivery
    }

    /// Unwraps a relayed frame addressed to us.
    ///
    /// Bare frames only arrive on the server socket, so the server has
    /// already stamped `frame.source`.
    pub fn accept_relay(&mut self, frame: Frame) -> Option<Delivery> {
        if !frame.targets.is_empty() && !frame.targets.contains(&self.maker.local) {
            debug!(from = %frame.source, "relayed frame not addressed to us");
            return None;
        }
        Some(Delivery::from_frame(frame))
    }

    /// Requests the channel `spec` to an existing peer.
    pub fn request_channel(&mut self, peer: &PeerId, spec: ChannelSpec) -> Result<(), SessionError> {
        let result = self.existing(peer)?.request_channel(spec);
        self.collect(peer);
        result
    }

    /// Sends application data to an existing peer.
    pub fn send(
        &mut self,
        peer: &PeerId,
        reliable: bool,
        category: PayloadCategory,
        payload: Vec<u8>,
    ) -> Result<(), SessionError> {
        self.existing(peer)?.send(reliable, category, payload)
    }

    /// Closes and forgets the session for `peer`.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        match self.peers.get_mut(peer) {
            Some(session) => {
                session.close();
                self.retired.extend(session.take_events());
                self.collect(peer);
                self.peers.remove(peer);
                true
            }
            None => false,
        }
    }

    /// Closes every session, discarding queued sends, and returns their
    /// final events.
    pub fn close_all(&mut self) -> Vec<SessionEvent> {
        let mut events = std::mem::take(&mut self.retired);
        for session in self.peers.values_mut() {
            session.close();
            events.extend(session.take_events());
        }
        self.peers.clear();
        self.outbox.clear();
        events
    }

    /// Drains outbound signaling from every session.
    pub fn take_outgoing(&mut self) -> Vec<SignalingEnvelope> {
        let mut out = std::mem::take(&mut self.outbox);
        for session in self.peers.values_mut() {
            out.extend(session.take_outgoing());
        }
        out
    }

    /// Drains lifecycle events from every session.
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        let mut events = std::mem::take(&mut self.retired);
        for session in self.peers.values_mut() {
            events.extend(session.take_events());
        }
        events
    }

    fn existing(&mut self, peer: &PeerId) -> Result<&mut PeerSession, SessionError> {
        self.peers.get_mut(peer).ok_or_else(|| {
            error!(%peer, "no session for peer");
            SessionError::UnknownPeer(peer.clone())
        })
    }

    /// Moves a session's outbox into the registry's, preserving order.
    fn collect(&mut self, peer: &PeerId) {
        if let Some(session) = self.peers.get_mut(peer) {
            self.outbox.extend(session.take_outgoing());
        }
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("local", &self.maker.local)
            .field("peers", &self.peers)
            .field("direct", &self.maker.factory.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tandem_protocol::IceCandidate;

    use super::*;
    use crate::testing::{FakeFactory, RecordingFrames};
    use crate::{Negotiation, PeerState};

    struct Fixture {
        registry: PeerRegistry,
        frames: Arc<RecordingFrames>,
        factory: Arc<FakeFactory>,
        _events: mpsc::UnboundedReceiver<(PeerId, PeerEvent)>,
    }

    fn fixture(direct: bool) -> Fixture {
        let frames = Arc::new(RecordingFrames::default());
        let factory = Arc::new(FakeFactory::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = PeerRegistry::new(
            frames.clone(),
            direct.then(|| factory.clone() as Arc<dyn PeerConnectorFactory>),
            WireCodec::new(),
            tx,
        );
        registry.set_local(PeerId::new("alice"));
        Fixture {
            registry,
            frames,
            factory,
            _events: rx,
        }
    }

    fn from(source: &str, message: SignalingMessage) -> SignalingEnvelope {
        SignalingEnvelope::new(PeerId::new(source), PeerId::new("alice"), message)
    }

    fn data_spec() -> ChannelSpec {
        ChannelSpec::new("data", true, PayloadCategory::Data)
    }

    #[test]
    fn test_server_channel_opens_on_confirmation_and_flushes() {
        let mut f = fixture(true);
        let server = PeerId::server();
        f.registry.connect(&server).unwrap();
        assert!(f.registry.get(&server).unwrap().is_relay_only());

        f.registry.request_channel(&server, data_spec()).unwrap();
        assert_eq!(f.registry.channel_state(&server, "data"), Some(ChannelState::Opening));
        let out = f.registry.take_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target, server);
        assert_eq!(out[0].message, SignalingMessage::ChannelAnnounce(data_spec()));

        for n in 0..3u8 {
            f.registry.send(&server, true, PayloadCategory::Data, vec![n]).unwrap();
        }
        assert!(f.frames.taken().is_empty());

        f.registry
            .handle_signal(from(PeerId::SERVER, SignalingMessage::ChannelAnnounce(data_spec())))
            .unwrap();
        assert_eq!(f.registry.channel_state(&server, "data"), Some(ChannelState::Open));
        f.registry.send(&server, true, PayloadCategory::Data, vec![3]).unwrap();

        let payloads: Vec<Vec<u8>> = f.frames.taken().into_iter().map(|fr| fr.payload).collect();
        assert_eq!(payloads, vec![vec![0], vec![1], vec![2], vec![3]]);
        assert_eq!(*f.factory.connects.lock().unwrap(), 0);
    }

    #[test]
    fn test_connect_racing_offer_yields_one_session() {
        let mut f = fixture(true);
        let bob = PeerId::new("bob");

        f.registry.connect(&bob).unwrap();
        f.registry
            .handle_signal(from("bob", SignalingMessage::Offer { sdp: "bob-offer".into() }))
            .unwrap();
        f.registry
            .handle_signal(from("bob", SignalingMessage::IceCandidate(IceCandidate::new("c1"))))
            .unwrap();

        assert_eq!(f.registry.len(), 1);
        assert_eq!(*f.factory.connects.lock().unwrap(), 1);
        // alice < bob: alice is polite and answers bob's offer.
        assert_eq!(
            f.registry.get(&bob).unwrap().state(),
            PeerState::Negotiating(Negotiation::BothSet)
        );
        let kinds: Vec<_> = f
            .registry
            .take_outgoing()
            .into_iter()
            .map(|e| e.message.name())
            .collect();
        assert_eq!(kinds, vec!["offer", "answer"]);
    }

    #[test]
    fn test_offer_first_then_connect_does_not_reoffer() {
        let mut f = fixture(true);
        let bob = PeerId::new("bob");
        f.registry
            .handle_signal(from("bob", SignalingMessage::Offer { sdp: "o".into() }))
            .unwrap();
        f.registry.connect(&bob).unwrap();
        assert_eq!(f.registry.len(), 1);
        let kinds: Vec<_> = f
            .registry
            .take_outgoing()
            .into_iter()
            .map(|e| e.message.name())
            .collect();
        assert_eq!(kinds, vec!["answer"]);
    }

    #[test]
    fn test_send_to_unknown_peer_is_error() {
        let mut f = fixture(false);
        let err = f
            .registry
            .send(&PeerId::new("ghost"), true, PayloadCategory::Data, vec![])
            .unwrap_err();
        assert_eq!(err, SessionError::UnknownPeer(PeerId::new("ghost")));
    }

    #[test]
    fn test_answer_from_unknown_peer_requests_restart() {
        let mut f = fixture(true);
        f.registry
            .handle_signal(from("carol", SignalingMessage::Answer { sdp: "a".into() }))
            .unwrap();
        assert!(f.registry.is_empty());
        let out = f.registry.take_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target, PeerId::new("carol"));
        assert_eq!(out[0].message, SignalingMessage::RestartNegotiation);
    }

    #[test]
    fn test_peer_leave_removes_session() {
        let mut f = fixture(false);
        f.registry
            .handle_signal(from("bob", SignalingMessage::PeerJoin))
            .unwrap();
        assert_eq!(f.registry.len(), 1);
        f.registry.take_events();
        f.registry
            .handle_signal(from("bob", SignalingMessage::PeerLeave))
            .unwrap();
        assert!(f.registry.is_empty());
        assert_eq!(
            f.registry.take_events(),
            vec![SessionEvent::PeerClosed { peer: PeerId::new("bob") }]
        );
    }

    #[test]
    fn test_relay_frame_addressed_elsewhere_is_ignored() {
        let mut f = fixture(false);
        let frame = |target: &str| Frame {
            source: PeerId::new("bob"),
            targets: [PeerId::new(target)].into_iter().collect(),
            category: PayloadCategory::Data,
            reliable: true,
            payload: vec![7],
        };
        let mine = f
            .registry
            .handle_signal(from("bob", SignalingMessage::Relay(frame("alice"))))
            .unwrap();
        assert_eq!(mine.map(|d| d.payload), Some(vec![7]));
        let theirs = f
            .registry
            .handle_signal(from("bob", SignalingMessage::Relay(frame("carol"))))
            .unwrap();
        assert!(theirs.is_none());
    }

    #[test]
    fn test_relay_frame_with_forged_source_is_dropped() {
        let mut f = fixture(false);
        let frame = |source: &str| Frame {
            source: PeerId::new(source),
            targets: [PeerId::new("alice")].into_iter().collect(),
            category: PayloadCategory::Data,
            reliable: true,
            payload: vec![9],
        };
        let forged = f
            .registry
            .handle_signal(from("mallory", SignalingMessage::Relay(frame("bob"))))
            .unwrap();
        assert!(forged.is_none());

        let forwarded = f
            .registry
            .handle_signal(SignalingEnvelope::new(
                PeerId::server(),
                PeerId::new("alice"),
                SignalingMessage::Relay(frame("bob")),
            ))
            .unwrap();
        assert_eq!(forwarded.map(|d| d.peer), Some(PeerId::new("bob")));
    }

    #[test]
    fn test_without_factory_peers_are_relay_only() {
        let mut f = fixture(false);
        f.registry.connect(&PeerId::new("bob")).unwrap();
        let bob = f.registry.get(&PeerId::new("bob")).unwrap();
        assert!(bob.is_relay_only());
        assert_eq!(bob.state(), PeerState::Ready);
        assert!(f.registry.take_outgoing().is_empty());
    }

    #[test]
    fn test_close_all_reports_closures() {
        let mut f = fixture(false);
        f.registry.connect(&PeerId::server()).unwrap();
        f.registry.request_channel(&PeerId::server(), data_spec()).unwrap();
        f.registry.take_events();

        let events = f.registry.close_all();
        assert!(f.registry.is_empty());
        assert!(events.contains(&SessionEvent::PeerClosed { peer: PeerId::server() }));
        assert!(f.registry.take_outgoing().is_empty());
    }
}
