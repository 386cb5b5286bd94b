/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The remote closed the connection abnormally (or the stream ended
    /// without a close frame).
    #[error("connection closed (code {code:?}): {reason}")]
    Closed {
        /// WebSocket close code, when the remote sent one.
        code: Option<u16>,
        /// Human-readable reason.
        reason: String,
    },

    /// Opening the connection failed.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),
}

impl TransportError {
    /// Builds a [`TransportError::Closed`] without a close code.
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::Closed {
            code: None,
            reason: reason.into(),
        }
    }

    /// Wraps any displayable error as an I/O error of the given kind.
    pub(crate) fn io(
        kind: std::io::ErrorKind,
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> std::io::Error {
        std::io::Error::new(kind, err)
    }
}
