//! Peer sessions and channels for Tandem.
//!
//! This crate is the data plane:
//!
//! 1. **Channels** ([`Channel`]): typed, reliability-tagged conduits that
//!    queue while opening and flush FIFO on open.
//! 2. **Peer sessions** ([`PeerSession`]): the offer/answer/candidate state
//!    machine per remote peer, owning that peer's channels.
//! 3. **Relay fallback** ([`RelaySink`]): the same channel contract
//!    tunnelled through signaling, used for the server and whenever no
//!    peer transport exists.
//! 4. **Registry** ([`PeerRegistry`]): one session per peer id, plus the
//!    router for inbound signaling.
//!
//! # How it fits in the stack
//!
//! ```text
//! Client runtime (above)  ← owns the registry on its session loop
//!     ↕
//! Session layer (this crate)  ← peers, channels, relay
//!     ↕
//! Protocol layer (below)  ← PeerId, Frame, SignalingEnvelope
//! ```
//!
//! Apart from the identity hook nothing here is async or thread-safe. It all
//! runs on one task, and transport callbacks reach it as [`PeerEvent`]s.

#![allow(async_fn_in_trait)]

mod auth;
mod channel;
mod error;
mod events;
mod peer;
mod registry;
mod relay;
#[cfg(test)]
mod testing;

pub use auth::{AnonymousIdentity, Credentials, IdentityProvider};
pub use channel::{Channel, ChannelSink, ChannelState};
pub use error::SessionError;
pub use events::{Subscribers, SubscriptionId};
pub use peer::{
    Negotiation, PeerConnector, PeerConnectorFactory, PeerEvent, PeerEventSink, PeerSession,
    PeerState, SessionEvent,
};
pub use registry::PeerRegistry;
pub use relay::{DataChannel, Delivery, DirectSink, FrameSink, RelaySink};
