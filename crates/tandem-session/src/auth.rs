//! The identity provider hook.
//!
//! Tandem does not authenticate users itself. The host application plugs
//! in an [`IdentityProvider`] that supplies credentials for the handshake
//! and HTTP requests, and decides whether newly required libraries may be
//! downloaded.

use tandem_protocol::Token;

use crate::SessionError;

/// What the identity provider hands back for a login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Display name or user id, sent with identity updates.
    pub user: String,
    /// Initial bearer token, if the provider already holds one.
    pub token: Option<Token>,
}

/// Supplies credentials and answers download prompts.
///
/// # Example
///
/// ```rust
/// use tandem_session::{Credentials, IdentityProvider, SessionError};
///
/// struct Kiosk;
///
/// impl IdentityProvider for Kiosk {
///     async fn credentials(&self) -> Result<Credentials, SessionError> {
///         Ok(Credentials { user: "kiosk-3".into(), token: None })
///     }
///
///     async fn approve_library_download(&self, _libraries: &[String]) -> bool {
///         true
///     }
/// }
/// ```
pub trait IdentityProvider: Send + Sync + 'static {
    /// Credentials for the current user.
    fn credentials(
        &self,
    ) -> impl std::future::Future<Output = Result<Credentials, SessionError>> + Send;

    /// Whether the listed libraries may be downloaded.
    fn approve_library_download(
        &self,
        libraries: &[String],
    ) -> impl std::future::Future<Output = bool> + Send;
}

/// Anonymous identity that never approves downloads.
#[derive(Debug, Clone, Default)]
pub struct AnonymousIdentity;

impl IdentityProvider for AnonymousIdentity {
    async fn credentials(&self) -> Result<Credentials, SessionError> {
        Ok(Credentials {
            user: "anonymous".into(),
            token: None,
        })
    }

    async fn approve_library_download(&self, _libraries: &[String]) -> bool {
        false
    }
}
