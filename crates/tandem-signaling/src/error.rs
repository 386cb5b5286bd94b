//! Error types for the signaling layer.

use crate::SocketKind;

/// Errors surfaced by the signaling layer.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    /// The socket is neither open nor connecting.
    #[error("{0} socket is not connected")]
    NotConnected(SocketKind),

    /// The channel was shut down.
    #[error("signaling channel shut down")]
    Shutdown,

    /// The configuration is unusable.
    #[error("invalid signaling config: {0}")]
    Config(String),

    /// A transport-level failure.
    #[error(transparent)]
    Transport(#[from] tandem_transport::TransportError),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Wire(#[from] tandem_protocol::WireError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_connected_names_socket() {
        let err = SignalingError::NotConnected(SocketKind::LowLatency);
        assert_eq!(err.to_string(), "low-latency socket is not connected");
    }
}
