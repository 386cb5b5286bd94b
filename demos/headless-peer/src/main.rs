use std::time::Duration;

use tandem::prelude::*;
use tandem::protocol::Token;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Identity from the environment
// ---------------------------------------------------------------------------

/// `TANDEM_USER`, plus an optional `TANDEM_TOKEN` for the first handshake.
struct EnvIdentity {
    user: String,
    token: Option<String>,
    approve_downloads: bool,
}

impl EnvIdentity {
    fn load() -> Self {
        Self {
            user: std::env::var("TANDEM_USER").unwrap_or_else(|_| "headless".into()),
            token: std::env::var("TANDEM_TOKEN").ok(),
            approve_downloads: std::env::var_os("TANDEM_APPROVE_DOWNLOADS").is_some(),
        }
    }
}

impl IdentityProvider for EnvIdentity {
    async fn credentials(&self) -> Result<Credentials, SessionError> {
        Ok(Credentials {
            user: self.user.clone(),
            token: self.token.clone().map(|value| Token::new(value, 0)),
        })
    }

    async fn approve_library_download(&self, libraries: &[String]) -> bool {
        tracing::info!(?libraries, approved = self.approve_downloads, "library download prompt");
        self.approve_downloads
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

fn config() -> ClientConfig {
    let api = std::env::var("TANDEM_API_URL").unwrap_or_else(|_| "http://127.0.0.1:8080/api".into());
    let signal =
        std::env::var("TANDEM_SIGNAL_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080/signal".into());
    let mut config = ClientConfig::new(api, signal).client_name("headless-peer");
    if let Ok(url) = std::env::var("TANDEM_LOW_LATENCY_URL") {
        config.signaling = config.signaling.low_latency_url(url);
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let client = TandemClientBuilder::new(config())
        .identity(EnvIdentity::load())
        .payload_handler(|peer: &PeerId, category: PayloadCategory, bytes: &[u8]| {
            tracing::info!(%peer, %category, len = bytes.len(), "payload");
        })
        .build()?;

    client
        .subscribe(|event: &ClientEvent| tracing::info!(?event, "client event"))
        .await?;

    let peer = client.connect().await?;
    tracing::info!(%peer, "authenticated, waiting for the session to become ready");
    client.wait_until(Condition::Connected).await?;
    client
        .wait_until(Condition::ChannelOpen {
            peer: PeerId::server(),
            label: "tracking".into(),
        })
        .await?;

    let mut heartbeat = tokio::time::interval(Duration::from_secs(1));
    let mut beat: u64 = 0;
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                beat += 1;
                let payload = beat.to_le_bytes().to_vec();
                if let Err(err) = client
                    .send(PeerId::server(), false, PayloadCategory::Tracking, payload)
                    .await
                {
                    tracing::warn!(%err, "heartbeat not sent");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("logging out");
    client.logout().await?;
    client.shutdown().await?;
    Ok(())
}
