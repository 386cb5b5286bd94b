//! What the client reports to the application.

use std::collections::BTreeSet;
use std::fmt;

use tandem_protocol::{PayloadCategory, PeerId, RemoteStatus};
use tandem_session::SessionEvent;

use crate::lifecycle::LifecycleState;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Lifecycle notifications published to subscribers, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The server acknowledged the handshake and assigned our id.
    Authenticated { peer: PeerId },
    /// The server reported a new session status.
    StatusChanged(RemoteStatus),
    /// Join succeeded.
    Connected { session_id: String },
    /// Join failed for good; a later `join` may try again.
    JoinFailed { reason: String },
    /// The identity provider answered a library download prompt.
    LibrariesApproved { libraries: Vec<String>, approved: bool },
    /// A peer or channel changed state.
    Session(SessionEvent),
    /// The signaling connection is gone and will not come back by itself.
    ConnectionLost,
    LoggedOut,
}

/// Receives application payloads from peers and the relay.
///
/// Closures with the matching signature implement it.
pub trait PayloadHandler: Send + 'static {
    fn on_payload(&mut self, peer: &PeerId, category: PayloadCategory, bytes: &[u8]);
}

impl<F> PayloadHandler for F
where
    F: FnMut(&PeerId, PayloadCategory, &[u8]) + Send + 'static,
{
    fn on_payload(&mut self, peer: &PeerId, category: PayloadCategory, bytes: &[u8]) {
        self(peer, category, bytes)
    }
}

/// Drops every payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardPayloads;

impl PayloadHandler for DiscardPayloads {
    fn on_payload(&mut self, peer: &PeerId, category: PayloadCategory, bytes: &[u8]) {
        tracing::trace!(%peer, %category, len = bytes.len(), "payload discarded");
    }
}

// ---------------------------------------------------------------------------
// State snapshots
// ---------------------------------------------------------------------------

/// A point-in-time view of the client, rebuilt by the session loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientState {
    pub lifecycle: LifecycleState,
    pub local_peer: Option<PeerId>,
    pub session_id: Option<String>,
    pub peers: BTreeSet<PeerId>,
    /// `(peer, label)` of every open channel.
    pub open_channels: BTreeSet<(PeerId, String)>,
}

impl ClientState {
    pub fn is_channel_open(&self, peer: &PeerId, label: &str) -> bool {
        self.open_channels
            .iter()
            .any(|(p, l)| p == peer && l == label)
    }
}

/// Something [`TandemClient::wait_until`](crate::TandemClient::wait_until)
/// can wait for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Joined a session.
    Connected,
    /// The channel `label` to `peer` is open.
    ChannelOpen { peer: PeerId, label: String },
    /// No session is active.
    LoggedOut,
}

impl Condition {
    /// Whether the condition holds for `state`.
    pub fn holds(&self, state: &ClientState) -> bool {
        match self {
            Self::Connected => state.lifecycle == LifecycleState::Connected,
            Self::ChannelOpen { peer, label } => state.is_channel_open(peer, label),
            Self::LoggedOut => state.lifecycle == LifecycleState::Disconnected,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::ChannelOpen { peer, label } => write!(f, "channel {label:?} to {peer} open"),
            Self::LoggedOut => write!(f, "logged out"),
        }
    }
}
