//! Signaling configuration and per-socket state.

use std::fmt;
use std::time::Duration;

use crate::SignalingError;

// ---------------------------------------------------------------------------
// SignalingConfig
// ---------------------------------------------------------------------------

/// Configuration for a [`SignalingChannel`](crate::SignalingChannel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingConfig {
    /// Url of the reliable socket. Required.
    pub reliable_url: String,

    /// Url of the low-latency socket. When absent, low-latency traffic
    /// goes over the reliable socket.
    pub low_latency_url: Option<String>,

    /// Fixed wait between a failed connection and the next attempt.
    pub reconnect_delay: Duration,

    /// Connection attempts (the first one included) before giving up.
    pub max_attempts: u32,

    /// How long to wait for the server to acknowledge the handshake.
    pub handshake_timeout: Duration,
}

impl SignalingConfig {
    /// A config with defaults for everything but the reliable url.
    pub fn new(reliable_url: impl Into<String>) -> Self {
        Self {
            reliable_url: reliable_url.into(),
            ..Self::default()
        }
    }

    /// Sets the low-latency socket url.
    pub fn low_latency_url(mut self, url: impl Into<String>) -> Self {
        self.low_latency_url = Some(url.into());
        self
    }

    /// Sets the reconnect delay.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the attempt limit.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Checks the config is usable.
    pub fn validate(&self) -> Result<(), SignalingError> {
        if self.reliable_url.is_empty() {
            return Err(SignalingError::Config("reliable url is empty".into()));
        }
        if self.max_attempts == 0 {
            return Err(SignalingError::Config("max_attempts must be at least 1".into()));
        }
        if self.low_latency_url.as_deref() == Some("") {
            return Err(SignalingError::Config("low-latency url is empty".into()));
        }
        Ok(())
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            reliable_url: String::new(),
            low_latency_url: None,
            reconnect_delay: Duration::from_secs(2),
            max_attempts: 10,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// SocketKind / SocketState
// ---------------------------------------------------------------------------

/// Which of the two signaling sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    /// Ordered, reliable delivery. Carries the handshake and negotiation.
    Reliable,
    /// Latency-sensitive traffic such as tracking updates.
    LowLatency,
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reliable => write!(f, "reliable"),
            Self::LowLatency => write!(f, "low-latency"),
        }
    }
}

/// Lifecycle of one socket.
///
/// ```text
/// Disconnected → Connecting → Open → Closing → Disconnected
///                    ↑          │
///                    └──────────┘ (abnormal close, after the reconnect delay)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl SocketState {
    /// `true` if a send would be accepted (sent or queued).
    pub fn accepts_sends(&self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Open => write!(f, "Open"),
            Self::Closing => write!(f, "Closing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signaling_config_default() {
        let config = SignalingConfig::default();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.reconnect_delay, Duration::from_secs(2));
        assert!(config.low_latency_url.is_none());
    }

    #[test]
    fn test_validate_rejects_empty_url_and_zero_attempts() {
        assert!(SignalingConfig::default().validate().is_err());
        assert!(SignalingConfig::new("ws://x").max_attempts(0).validate().is_err());
        assert!(SignalingConfig::new("ws://x").low_latency_url("").validate().is_err());
        assert!(SignalingConfig::new("ws://x").validate().is_ok());
    }

    #[test]
    fn test_socket_state_accepts_sends() {
        assert!(SocketState::Connecting.accepts_sends());
        assert!(SocketState::Open.accepts_sends());
        assert!(!SocketState::Disconnected.accepts_sends());
        assert!(!SocketState::Closing.accepts_sends());
    }
}
