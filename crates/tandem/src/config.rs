//! Client configuration.

use std::collections::BTreeSet;

use tandem_http::RetryConfig;
use tandem_protocol::{ChannelSpec, PayloadCategory};
use tandem_signaling::SignalingConfig;
use tandem_tick::TickConfig;

use crate::TandemError;

/// Everything a [`TandemClient`](crate::TandemClient) needs to reach a
/// session server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Root of the HTTP API, e.g. `https://host/api`.
    pub api_base_url: String,
    /// Sent in the signaling handshake.
    pub client_name: String,
    /// Channels requested to the server once joined.
    pub default_channels: Vec<ChannelSpec>,
    pub signaling: SignalingConfig,
    pub retry: RetryConfig,
    pub tick: TickConfig,
}

impl ClientConfig {
    /// A config with default channels and timings.
    pub fn new(api_base_url: impl Into<String>, signaling_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            signaling: SignalingConfig::new(signaling_url),
            ..Self::default()
        }
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    /// Replaces the channels requested on join.
    pub fn default_channels(mut self, channels: Vec<ChannelSpec>) -> Self {
        self.default_channels = channels;
        self
    }

    pub fn signaling(mut self, signaling: SignalingConfig) -> Self {
        self.signaling = signaling;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn tick(mut self, tick: TickConfig) -> Self {
        self.tick = tick;
        self
    }

    /// Rejects configs the client cannot run with.
    pub fn validate(&self) -> Result<(), TandemError> {
        if self.api_base_url.trim().is_empty() {
            return Err(TandemError::Config("api_base_url is empty".into()));
        }
        if self.client_name.trim().is_empty() {
            return Err(TandemError::Config("client_name is empty".into()));
        }
        let mut labels = BTreeSet::new();
        for spec in &self.default_channels {
            if !labels.insert(spec.label.as_str()) {
                return Err(TandemError::Config(format!(
                    "default channel {:?} listed twice",
                    spec.label
                )));
            }
        }
        self.signaling.validate()?;
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            client_name: concat!("tandem/", env!("CARGO_PKG_VERSION")).to_owned(),
            default_channels: vec![
                ChannelSpec::new("data", true, PayloadCategory::Data),
                ChannelSpec::new("tracking", false, PayloadCategory::Tracking),
            ],
            signaling: SignalingConfig::default(),
            retry: RetryConfig::default(),
            tick: TickConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ClientConfig {
        ClientConfig::new("http://localhost/api", "ws://localhost/signal")
    }

    #[test]
    fn test_default_channels_cover_data_and_tracking() {
        let config = valid();
        let labels: Vec<_> = config.default_channels.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, ["data", "tracking"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_api_url() {
        let config = ClientConfig::new("", "ws://localhost/signal");
        assert!(matches!(config.validate(), Err(TandemError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_channel_labels() {
        let config = valid().default_channels(vec![
            ChannelSpec::new("data", true, PayloadCategory::Data),
            ChannelSpec::new("data", false, PayloadCategory::Tracking),
        ]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("data"));
    }

    #[test]
    fn test_validate_checks_signaling() {
        let config = valid().signaling(SignalingConfig::new(""));
        assert!(matches!(config.validate(), Err(TandemError::Signaling(_))));
    }
}
