//! Unified error type for Tandem.

use tandem_http::HttpError;
use tandem_protocol::WireError;
use tandem_session::SessionError;
use tandem_signaling::SignalingError;
use tandem_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` conversions let `?` lift sub-crate errors directly.
#[derive(Debug, thiserror::Error)]
pub enum TandemError {
    /// A control-socket failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Bytes that could not be encoded or decoded.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// A peer or channel error, including sends to unknown peers.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A signaling socket error.
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// An HTTP request failed for good.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The configuration is unusable.
    #[error("invalid config: {0}")]
    Config(String),

    /// The server did not acknowledge the handshake in time.
    #[error("handshake not acknowledged within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    /// The signaling connection was lost before the operation completed.
    #[error("connection lost")]
    ConnectionLost,

    /// The session loop has stopped.
    #[error("client stopped")]
    Stopped,
}
