//! Session lifecycle as a pure state machine.
//!
//! [`SessionManager`] does no I/O. Each input returns the [`Effect`]s the
//! client runtime must carry out, so the connect, join, and logout rules
//! can be tested without sockets or HTTP.
//!
//! ```text
//!  Disconnected --connect--> Connecting --HandshakeAck--> Authenticated
//!       ^                                                   |     ^
//!       |                                            join() |     | join failed
//!       |                                                   v     |
//!       +------------- logout / connection lost -------- Joining -+
//!                                                           |
//!                                              join succeeded
//!                                                           v
//!                                                       Connected
//! ```

use std::fmt;

use tandem_http::{Identity, JoinResponse, Library};
use tandem_protocol::{PeerId, RemoteStatus, Token};
use tracing::{debug, info, warn};

use crate::ClientEvent;

/// Where the client is in the session lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    #[default]
    Disconnected,
    /// Signaling is opening; waiting for the handshake acknowledgement.
    Connecting,
    /// The server knows who we are. Not yet in a session.
    Authenticated,
    /// A join request is in flight.
    Joining,
    /// Joined.
    Connected,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Authenticated => write!(f, "Authenticated"),
            Self::Joining => write!(f, "Joining"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Work the client runtime performs on behalf of the [`SessionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Fetch credentials and start the signaling sockets.
    OpenSignaling,
    /// Close both sockets and cancel any scheduled reconnect.
    ShutdownSignaling,
    /// Record the id the server assigned to us.
    AssignLocalPeer(PeerId),
    /// GET identity.
    FetchIdentity,
    /// GET status.
    FetchStatus,
    /// POST join.
    Join,
    /// Store a token the server handed out.
    PublishToken(Token),
    /// Create the server peer and request the default channels.
    OpenServerSession,
    /// GET libraries.
    FetchLibraries,
    /// Ask the identity provider whether these may be downloaded.
    RequestLibraryApproval(Vec<String>),
    /// Close every peer session.
    CloseAllPeers,
    /// POST logout, then drop the token it used.
    PostLogout,
    /// Publish to subscribers.
    Notify(ClientEvent),
}

/// Connect, join, and logout rules.
#[derive(Debug, Default)]
pub struct SessionManager {
    state: LifecycleState,
    local_peer: Option<PeerId>,
    identity: Option<Identity>,
    status: Option<RemoteStatus>,
    session_id: Option<String>,
    join_in_flight: bool,
    identity_in_flight: bool,
    join_when_identified: bool,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn local_peer(&self) -> Option<&PeerId> {
        self.local_peer.as_ref()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn status(&self) -> Option<&RemoteStatus> {
        self.status.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// `true` while a join request is outstanding.
    pub fn join_in_flight(&self) -> bool {
        self.join_in_flight
    }

    /// Starts connecting. Ignored unless disconnected.
    pub fn connect(&mut self) -> Vec<Effect> {
        if self.state != LifecycleState::Disconnected {
            debug!(state = %self.state, "connect ignored");
            return Vec::new();
        }
        self.transition(LifecycleState::Connecting);
        vec![Effect::OpenSignaling]
    }

    /// The server acknowledged our handshake.
    ///
    /// After a reconnect the server acknowledges again; only a changed id
    /// is applied then.
    pub fn on_handshake_ack(&mut self, peer: PeerId) -> Vec<Effect> {
        match self.state {
            LifecycleState::Disconnected => {
                debug!(%peer, "handshake ack while disconnected ignored");
                Vec::new()
            }
            LifecycleState::Connecting => {
                self.transition(LifecycleState::Authenticated);
                self.local_peer = Some(peer.clone());
                let mut effects = vec![
                    Effect::AssignLocalPeer(peer.clone()),
                    Effect::Notify(ClientEvent::Authenticated { peer }),
                ];
                effects.extend(self.fetch_identity());
                effects.push(Effect::FetchStatus);
                effects
            }
            _ if self.local_peer.as_ref() == Some(&peer) => Vec::new(),
            _ => {
                warn!(%peer, "server reassigned our peer id");
                self.local_peer = Some(peer.clone());
                vec![Effect::AssignLocalPeer(peer)]
            }
        }
    }

    /// The handshake was not acknowledged in time.
    pub fn on_handshake_timeout(&mut self) -> Vec<Effect> {
        if self.state != LifecycleState::Connecting {
            return Vec::new();
        }
        warn!("handshake timed out");
        self.reset();
        vec![
            Effect::ShutdownSignaling,
            Effect::Notify(ClientEvent::ConnectionLost),
        ]
    }

    /// Result of GET identity.
    pub fn on_identity(&mut self, result: Result<Identity, String>) -> Vec<Effect> {
        self.identity_in_flight = false;
        if self.state == LifecycleState::Disconnected {
            return Vec::new();
        }
        match result {
            Ok(identity) => {
                info!(user = %identity.user, "identity known");
                self.identity = Some(identity);
                if std::mem::take(&mut self.join_when_identified) {
                    self.join()
                } else {
                    Vec::new()
                }
            }
            Err(reason) => {
                warn!(%reason, "identity unavailable");
                if std::mem::take(&mut self.join_when_identified) {
                    vec![Effect::Notify(ClientEvent::JoinFailed { reason })]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// The server reported a session status, over HTTP or signaling.
    ///
    /// `Ready` joins, fetching the identity first when it is unknown.
    pub fn on_status(&mut self, status: RemoteStatus) -> Vec<Effect> {
        if self.state == LifecycleState::Disconnected {
            return Vec::new();
        }
        let mut effects = Vec::new();
        if self.status.as_ref() != Some(&status) {
            info!(%status, "session status");
            self.status = Some(status.clone());
            effects.push(Effect::Notify(ClientEvent::StatusChanged(status.clone())));
        }
        if status == RemoteStatus::Ready && self.state == LifecycleState::Authenticated {
            if self.identity.is_some() {
                effects.extend(self.join());
            } else {
                self.join_when_identified = true;
                effects.extend(self.fetch_identity());
            }
        }
        effects
    }

    /// Joins the session. Idempotent while a join is in flight.
    pub fn join(&mut self) -> Vec<Effect> {
        if self.join_in_flight {
            debug!("join already in flight");
            return Vec::new();
        }
        if self.state != LifecycleState::Authenticated {
            debug!(state = %self.state, "join ignored");
            return Vec::new();
        }
        self.join_in_flight = true;
        self.transition(LifecycleState::Joining);
        vec![Effect::Join]
    }

    /// Result of POST join. Clears the in-flight guard either way.
    pub fn on_join_result(&mut self, result: Result<JoinResponse, String>) -> Vec<Effect> {
        self.join_in_flight = false;
        if self.state != LifecycleState::Joining {
            debug!(state = %self.state, "stale join result ignored");
            return Vec::new();
        }
        match result {
            Ok(response) => {
                self.transition(LifecycleState::Connected);
                self.session_id = Some(response.session_id.clone());
                let mut effects = Vec::new();
                if let Some(token) = response.token {
                    effects.push(Effect::PublishToken(token));
                }
                effects.extend([
                    Effect::OpenServerSession,
                    Effect::FetchLibraries,
                    Effect::Notify(ClientEvent::Connected {
                        session_id: response.session_id,
                    }),
                ]);
                effects
            }
            Err(reason) => {
                warn!(%reason, "join failed");
                self.transition(LifecycleState::Authenticated);
                vec![Effect::Notify(ClientEvent::JoinFailed { reason })]
            }
        }
    }

    /// The library list arrived. Missing ones need the user's approval.
    pub fn on_libraries(&mut self, libraries: &[Library]) -> Vec<Effect> {
        if self.state != LifecycleState::Connected {
            return Vec::new();
        }
        let missing: Vec<String> = libraries
            .iter()
            .filter(|library| !library.installed)
            .map(|library| library.name.clone())
            .collect();
        if missing.is_empty() {
            return Vec::new();
        }
        info!(count = missing.len(), "libraries missing");
        vec![Effect::RequestLibraryApproval(missing)]
    }

    /// Signaling gave up reconnecting, or the server closed it.
    pub fn on_connection_lost(&mut self) -> Vec<Effect> {
        if self.state == LifecycleState::Disconnected {
            return Vec::new();
        }
        self.reset();
        vec![
            Effect::CloseAllPeers,
            Effect::ShutdownSignaling,
            Effect::Notify(ClientEvent::ConnectionLost),
        ]
    }

    /// Leaves the session and forgets who we are.
    pub fn logout(&mut self) -> Vec<Effect> {
        let authenticated = !matches!(
            self.state,
            LifecycleState::Disconnected | LifecycleState::Connecting
        );
        let mut effects = vec![Effect::CloseAllPeers, Effect::ShutdownSignaling];
        if authenticated {
            effects.push(Effect::PostLogout);
        }
        self.reset();
        effects.push(Effect::Notify(ClientEvent::LoggedOut));
        effects
    }

    fn fetch_identity(&mut self) -> Option<Effect> {
        if self.identity.is_some() || self.identity_in_flight {
            return None;
        }
        self.identity_in_flight = true;
        Some(Effect::FetchIdentity)
    }

    fn transition(&mut self, next: LifecycleState) {
        info!(from = %self.state, to = %next, "lifecycle");
        self.state = next;
    }

    fn reset(&mut self) {
        if self.state != LifecycleState::Disconnected {
            self.transition(LifecycleState::Disconnected);
        }
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            user: "ada".into(),
            display_name: None,
            peer: None,
        }
    }

    fn joined(session_id: &str) -> JoinResponse {
        JoinResponse {
            session_id: session_id.into(),
            token: None,
        }
    }

    fn authenticated() -> SessionManager {
        let mut manager = SessionManager::new();
        manager.connect();
        manager.on_handshake_ack(PeerId::new("alice"));
        manager
    }

    #[test]
    fn test_connect_twice_opens_signaling_once() {
        let mut manager = SessionManager::new();
        assert_eq!(manager.connect(), vec![Effect::OpenSignaling]);
        assert!(manager.connect().is_empty());
        assert_eq!(manager.state(), LifecycleState::Connecting);
    }

    #[test]
    fn test_handshake_ack_authenticates_and_fetches() {
        let mut manager = SessionManager::new();
        manager.connect();
        let effects = manager.on_handshake_ack(PeerId::new("alice"));
        assert_eq!(
            effects,
            vec![
                Effect::AssignLocalPeer(PeerId::new("alice")),
                Effect::Notify(ClientEvent::Authenticated {
                    peer: PeerId::new("alice")
                }),
                Effect::FetchIdentity,
                Effect::FetchStatus,
            ]
        );
        assert_eq!(manager.state(), LifecycleState::Authenticated);
        assert_eq!(manager.local_peer(), Some(&PeerId::new("alice")));
    }

    #[test]
    fn test_repeated_ack_after_reconnect_is_quiet() {
        let mut manager = authenticated();
        assert!(manager.on_handshake_ack(PeerId::new("alice")).is_empty());
        assert_eq!(
            manager.on_handshake_ack(PeerId::new("alice-2")),
            vec![Effect::AssignLocalPeer(PeerId::new("alice-2"))]
        );
    }

    #[test]
    fn test_join_is_idempotent_while_in_flight() {
        let mut manager = authenticated();
        assert_eq!(manager.join(), vec![Effect::Join]);
        assert!(manager.join().is_empty());
        assert!(manager.join_in_flight());
        assert_eq!(manager.state(), LifecycleState::Joining);
    }

    #[test]
    fn test_join_success_connects_and_resets_guard() {
        let mut manager = authenticated();
        manager.join();
        let effects = manager.on_join_result(Ok(JoinResponse {
            session_id: "s-1".into(),
            token: Some(Token::new("tok-2", 2)),
        }));
        assert_eq!(
            effects,
            vec![
                Effect::PublishToken(Token::new("tok-2", 2)),
                Effect::OpenServerSession,
                Effect::FetchLibraries,
                Effect::Notify(ClientEvent::Connected {
                    session_id: "s-1".into()
                }),
            ]
        );
        assert_eq!(manager.state(), LifecycleState::Connected);
        assert!(!manager.join_in_flight());
        assert_eq!(manager.session_id(), Some("s-1"));
    }

    #[test]
    fn test_join_failure_allows_another_join() {
        let mut manager = authenticated();
        manager.join();
        let effects = manager.on_join_result(Err("503".into()));
        assert_eq!(
            effects,
            vec![Effect::Notify(ClientEvent::JoinFailed {
                reason: "503".into()
            })]
        );
        assert_eq!(manager.state(), LifecycleState::Authenticated);
        assert_eq!(manager.join(), vec![Effect::Join]);
    }

    #[test]
    fn test_ready_without_identity_fetches_then_joins() {
        let mut manager = SessionManager::new();
        manager.connect();
        manager.on_handshake_ack(PeerId::new("alice"));
        // The identity fetch from the ack failed.
        manager.on_identity(Err("timeout".into()));

        let effects = manager.on_status(RemoteStatus::Ready);
        assert_eq!(
            effects,
            vec![
                Effect::Notify(ClientEvent::StatusChanged(RemoteStatus::Ready)),
                Effect::FetchIdentity,
            ]
        );
        assert_eq!(manager.on_identity(Ok(identity())), vec![Effect::Join]);
    }

    #[test]
    fn test_ready_while_identity_in_flight_waits_for_it() {
        let mut manager = authenticated();
        let effects = manager.on_status(RemoteStatus::Ready);
        assert_eq!(
            effects,
            vec![Effect::Notify(ClientEvent::StatusChanged(RemoteStatus::Ready))]
        );
        assert_eq!(manager.on_identity(Ok(identity())), vec![Effect::Join]);
    }

    #[test]
    fn test_ready_with_identity_joins_immediately() {
        let mut manager = authenticated();
        manager.on_identity(Ok(identity()));
        let effects = manager.on_status(RemoteStatus::Ready);
        assert_eq!(effects.last(), Some(&Effect::Join));
        // Same status again changes nothing.
        assert!(manager.on_status(RemoteStatus::Ready).is_empty());
    }

    #[test]
    fn test_libraries_request_approval_for_missing_only() {
        let mut manager = authenticated();
        manager.join();
        manager.on_join_result(Ok(joined("s-1")));
        let libraries = [
            Library {
                name: "physics".into(),
                version: "1".into(),
                installed: true,
            },
            Library {
                name: "avatars".into(),
                version: "2".into(),
                installed: false,
            },
        ];
        assert_eq!(
            manager.on_libraries(&libraries),
            vec![Effect::RequestLibraryApproval(vec!["avatars".into()])]
        );
    }

    #[test]
    fn test_logout_resets_everything() {
        let mut manager = authenticated();
        manager.on_identity(Ok(identity()));
        manager.join();
        manager.on_join_result(Ok(joined("s-1")));

        let effects = manager.logout();
        assert_eq!(
            effects,
            vec![
                Effect::CloseAllPeers,
                Effect::ShutdownSignaling,
                Effect::PostLogout,
                Effect::Notify(ClientEvent::LoggedOut),
            ]
        );
        assert_eq!(manager.state(), LifecycleState::Disconnected);
        assert!(manager.identity().is_none());
        assert!(manager.local_peer().is_none());
        assert!(manager.session_id().is_none());
        assert_eq!(manager.connect(), vec![Effect::OpenSignaling]);
    }

    #[test]
    fn test_join_result_after_logout_is_ignored() {
        let mut manager = authenticated();
        manager.join();
        manager.logout();
        assert!(manager.on_join_result(Ok(joined("s-1"))).is_empty());
        assert_eq!(manager.state(), LifecycleState::Disconnected);
    }

    #[test]
    fn test_handshake_timeout_only_while_connecting() {
        let mut manager = SessionManager::new();
        manager.connect();
        assert_eq!(
            manager.on_handshake_timeout(),
            vec![
                Effect::ShutdownSignaling,
                Effect::Notify(ClientEvent::ConnectionLost)
            ]
        );
        assert!(manager.on_handshake_timeout().is_empty());
    }
}
