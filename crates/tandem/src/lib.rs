//! # Tandem
//!
//! Client library for live collaborative sessions.
//!
//! A [`TandemClient`] connects to a session server over a signaling socket
//! and its HTTP API, joins a session, and exchanges application payloads
//! with the server and other peers. Peers are reached over direct
//! transports when a [`PeerConnectorFactory`](tandem_session::PeerConnectorFactory)
//! is supplied, and through the server relay otherwise. The application
//! cannot tell the two paths apart.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tandem::prelude::*;
//!
//! # async fn run() -> Result<(), TandemError> {
//! let config = ClientConfig::new("https://host/api", "wss://host/signal");
//! let client = TandemClientBuilder::new(config)
//!     .payload_handler(|peer: &PeerId, category: PayloadCategory, bytes: &[u8]| {
//!         println!("{peer} sent {} {category} bytes", bytes.len());
//!     })
//!     .build()?;
//!
//! client.connect().await?;
//! client.wait_until(Condition::Connected).await?;
//! client
//!     .send(PeerId::server(), true, PayloadCategory::Data, b"hello".to_vec())
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # How it fits in the stack
//!
//! ```text
//! Application  ← PayloadHandler, ClientEvent subscribers
//!     ↕
//! Client runtime (this crate)  ← lifecycle, session loop, guards
//!     ↕
//! Session (tandem-session)  ← peers, channels, relay fallback
//!     ↕
//! Signaling / HTTP (tandem-signaling, tandem-http)
//!     ↕
//! Protocol / Transport (tandem-protocol, tandem-transport)
//! ```

mod client;
mod config;
mod error;
mod event;
pub mod lifecycle;

pub use client::{TandemClient, TandemClientBuilder};
pub use config::ClientConfig;
pub use error::TandemError;
pub use event::{ClientEvent, ClientState, Condition, DiscardPayloads, PayloadHandler};
pub use lifecycle::LifecycleState;

pub use tandem_http as http;
pub use tandem_protocol as protocol;
pub use tandem_session as session;
pub use tandem_signaling as signaling;
pub use tandem_tick as tick;
pub use tandem_transport as transport;

/// The types most applications need.
pub mod prelude {
    pub use crate::{
        ClientConfig, ClientEvent, ClientState, Condition, LifecycleState, PayloadHandler,
        TandemClient, TandemClientBuilder, TandemError,
    };
    pub use tandem_protocol::{ChannelSpec, PayloadCategory, PeerId, RemoteStatus};
    pub use tandem_session::{Credentials, IdentityProvider, SessionError};
}
