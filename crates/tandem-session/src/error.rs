//! Error types for the session layer.

use tandem_protocol::{PayloadCategory, PeerId};

/// Errors raised by peer sessions and channels.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No session exists for the peer. Sending to a peer nobody connected
    /// is a pairing bug, not a transient condition.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// The channel was closed; the payload was dropped.
    #[error("channel {label:?} to {peer} is closed")]
    ChannelClosed {
        /// Remote peer.
        peer: PeerId,
        /// Channel label.
        label: String,
    },

    /// No channel to the peer carries this kind of traffic. Channels are
    /// never created on the send path.
    #[error("no {category} channel (reliable={reliable}) to {peer}")]
    NoMatchingChannel {
        /// Remote peer.
        peer: PeerId,
        /// Requested reliability.
        reliable: bool,
        /// Requested payload category.
        category: PayloadCategory,
    },

    /// The peer transport rejected an operation.
    #[error("peer transport error: {0}")]
    Transport(String),

    /// The relay path could not accept a frame.
    #[error("relay unavailable: {0}")]
    Relay(String),

    /// The identity provider could not supply credentials.
    #[error("identity unavailable: {0}")]
    Identity(String),
}
