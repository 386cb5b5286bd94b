//! Typed client for the session server's HTTP API.

use std::time::{Duration, SystemTime};

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tandem_protocol::{PeerId, RemoteStatus, Token};

use crate::{AttemptError, HttpError, RequestFailure, RetryConfig, RetryPolicy, TokenWatcher};

// ---------------------------------------------------------------------------
// Request and response bodies
// ---------------------------------------------------------------------------

/// Who the server thinks we are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Our peer id in the session, once assigned.
    #[serde(default)]
    pub peer: Option<PeerId>,
}

/// Fields of an [`Identity`] the client may change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// The session's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub status: RemoteStatus,
}

/// A content library the session needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Library {
    pub name: String,
    pub version: String,
    /// Whether this client already has it.
    #[serde(default)]
    pub installed: bool,
}

/// The server's answer to a join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub session_id: String,
    /// A fresh token, when the server rotates credentials on join.
    #[serde(default)]
    pub token: Option<Token>,
}

/// Visibility of a generic resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceScope {
    /// Readable without credentials.
    Public,
    /// Requires the bearer token.
    Private,
}

impl ResourceScope {
    fn segment(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }

    fn needs_auth(self) -> bool {
        self == Self::Private
    }
}

enum Body {
    Empty,
    Json(Vec<u8>),
    Bytes(Vec<u8>),
}

// ---------------------------------------------------------------------------
// ApiClient
// ---------------------------------------------------------------------------

/// HTTP client for the session server.
///
/// Every call goes through the [`RetryPolicy`]. Authenticated calls carry
/// `Authorization: BEARER <token>` with the newest token in the store.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    retry: RetryPolicy,
}

impl ApiClient {
    /// Per-request timeout.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// A client for the API rooted at `base_url`.
    pub fn new(
        base_url: &str,
        tokens: TokenWatcher,
        retry: RetryConfig,
    ) -> Result<Self, HttpError> {
        let mut base_url =
            Url::parse(base_url).map_err(|_| HttpError::InvalidUrl(base_url.to_owned()))?;
        if base_url.cannot_be_a_base() {
            return Err(HttpError::InvalidUrl(base_url.to_string()));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .user_agent(concat!("tandem/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url,
            retry: RetryPolicy::new(retry, tokens),
        })
    }

    /// The API root.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// GET `identity`.
    pub async fn identity(&self) -> Result<Identity, HttpError> {
        self.get_json("identity").await
    }

    /// POST `identity`.
    pub async fn update_identity(&self, update: &IdentityUpdate) -> Result<Identity, HttpError> {
        self.post_json("identity", update).await
    }

    /// GET `status`.
    pub async fn status(&self) -> Result<SessionStatus, HttpError> {
        self.get_json("status").await
    }

    /// POST `status`.
    pub async fn update_status(&self, status: &RemoteStatus) -> Result<(), HttpError> {
        let body = SessionStatus {
            status: status.clone(),
        };
        self.execute(Method::POST, "status", json_body(&body)?, true)
            .await
            .map(drop)
    }

    /// POST `logout`, authorized with `token` rather than the store.
    ///
    /// The caller clears the store before the request goes out, so there is
    /// no newer token to retry a 401 with. One attempt only.
    pub async fn logout(&self, token: Option<&Token>) -> Result<(), HttpError> {
        let url = self.url("logout")?;
        tracing::debug!(%url, "http request");
        let first_attempt = SystemTime::now();
        let mut request = self.http.post(url.clone());
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("BEARER {}", token.value));
        }
        let last_status = match request.send().await {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => Some(response.status().as_u16()),
            Err(err) => {
                tracing::debug!(%url, %err, "logout request failed");
                None
            }
        };
        Err(HttpError::Exhausted(RequestFailure {
            attempt_count: 1,
            first_attempt,
            timestamp: SystemTime::now(),
            last_status,
            url: url.to_string(),
        }))
    }

    /// GET `media`. The descriptor is opaque to this crate.
    pub async fn media_descriptor(&self) -> Result<serde_json::Value, HttpError> {
        self.get_json("media").await
    }

    /// GET `libraries`.
    pub async fn libraries(&self) -> Result<Vec<Library>, HttpError> {
        self.get_json("libraries").await
    }

    /// GET `resources/{scope}/{path}`.
    pub async fn resource(&self, scope: ResourceScope, path: &str) -> Result<Vec<u8>, HttpError> {
        let path = format!("resources/{}/{}", scope.segment(), path.trim_start_matches('/'));
        self.execute(Method::GET, &path, Body::Empty, scope.needs_auth())
            .await
    }

    /// POST `resources/{scope}/{path}`.
    pub async fn put_resource(
        &self,
        scope: ResourceScope,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<(), HttpError> {
        let path = format!("resources/{}/{}", scope.segment(), path.trim_start_matches('/'));
        self.execute(Method::POST, &path, Body::Bytes(bytes), scope.needs_auth())
            .await
            .map(drop)
    }

    /// GET `environment`. The descriptor is opaque to this crate.
    pub async fn environment_descriptor(&self) -> Result<serde_json::Value, HttpError> {
        self.get_json("environment").await
    }

    /// POST `join`.
    pub async fn join(&self) -> Result<JoinResponse, HttpError> {
        self.execute(Method::POST, "join", Body::Empty, true)
            .await
            .and_then(|bytes| self.parse("join", &bytes))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, HttpError> {
        let bytes = self.execute(Method::GET, path, Body::Empty, true).await?;
        self.parse(path, &bytes)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, HttpError> {
        let bytes = self
            .execute(Method::POST, path, json_body(body)?, true)
            .await?;
        self.parse(path, &bytes)
    }

    /// Runs one logical request under the retry policy and returns the
    /// success body.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Body,
        auth: bool,
    ) -> Result<Vec<u8>, HttpError> {
        let url = self.url(path)?;
        tracing::debug!(%method, %url, "http request");
        self.retry
            .run(url.as_str(), |token| {
                let mut request = self.http.request(method.clone(), url.clone());
                if let (true, Some(token)) = (auth, &token) {
                    request = request.header(AUTHORIZATION, format!("BEARER {}", token.value));
                }
                request = match &body {
                    Body::Empty => request,
                    Body::Json(bytes) => request
                        .header(CONTENT_TYPE, "application/json")
                        .body(bytes.clone()),
                    Body::Bytes(bytes) => request
                        .header(CONTENT_TYPE, "application/octet-stream")
                        .body(bytes.clone()),
                };
                async move {
                    let response = request
                        .send()
                        .await
                        .map_err(|err| AttemptError::Transport(err.to_string()))?;
                    match response.status() {
                        StatusCode::UNAUTHORIZED => Err(AttemptError::Unauthorized),
                        status if !status.is_success() => Err(AttemptError::Status(status.as_u16())),
                        _ => response
                            .bytes()
                            .await
                            .map(|bytes| bytes.to_vec())
                            .map_err(|err| AttemptError::Transport(err.to_string())),
                    }
                }
            })
            .await
    }

    fn url(&self, path: &str) -> Result<Url, HttpError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|_| HttpError::InvalidUrl(format!("{}{path}", self.base_url)))
    }

    fn parse<T: DeserializeOwned>(&self, path: &str, bytes: &[u8]) -> Result<T, HttpError> {
        serde_json::from_slice(bytes).map_err(|source| HttpError::Decode {
            url: format!("{}{}", self.base_url, path.trim_start_matches('/')),
            source,
        })
    }
}

fn json_body<B: Serialize>(body: &B) -> Result<Body, HttpError> {
    serde_json::to_vec(body)
        .map(Body::Json)
        .map_err(HttpError::Encode)
}
