//! Signaling for Tandem: the control-plane sockets.
//!
//! A [`SignalingChannel`] owns up to two sockets, `Reliable` and
//! `LowLatency`, each driven by its own supervisor task:
//!
//! - **Handshake first**: on every open the current handshake frame is
//!   sent before anything else.
//! - **Dispatch by tag**: inbound frames are decoded with the
//!   [`WireCodec`](tandem_protocol::WireCodec) and reported as
//!   [`SignalingEvent::Message`]. Undecodable frames are logged and skipped.
//! - **Reconnect**: a failed connect or abnormal close reconnects after a
//!   fixed delay. A normal close is terminal, and so are `max_attempts`
//!   failed attempts in a row. Either way the socket reports
//!   [`SignalingEvent::ConnectionLost`] once and stops.
//!
//! # How it fits in the stack
//!
//! ```text
//! Client runtime (above)  ← consumes SignalingEvents on its session loop
//!     ↕
//! Signaling layer (this crate)  ← sockets, handshake, reconnect
//!     ↕
//! Transport layer (below)  ← Connector / Connection
//! ```

mod channel;
mod config;
mod error;
mod policy;
mod socket;

pub use channel::SignalingChannel;
pub use config::{SignalingConfig, SocketKind, SocketState};
pub use error::SignalingError;
pub use policy::{CloseKind, ReconnectDecision, ReconnectPolicy};
pub use socket::SignalingEvent;
