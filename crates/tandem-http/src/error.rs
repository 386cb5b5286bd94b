//! Error types for the HTTP layer.

use crate::RequestFailure;

/// Errors returned by [`ApiClient`](crate::ApiClient) and
/// [`RetryPolicy`](crate::RetryPolicy).
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The retry policy gave up.
    #[error("request abandoned: {0}")]
    Exhausted(RequestFailure),

    /// The base url and path do not form a valid url.
    #[error("invalid url {0}")]
    InvalidUrl(String),

    /// The response body did not match the expected shape.
    #[error("unexpected response body from {url}: {source}")]
    Decode {
        /// The request url.
        url: String,
        /// What failed to parse.
        #[source]
        source: serde_json::Error,
    },

    /// A request body could not be serialized.
    #[error("request body: {0}")]
    Encode(#[source] serde_json::Error),

    /// The HTTP client could not be built.
    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
}

impl HttpError {
    /// The structured failure, when the retry policy gave up.
    pub fn failure(&self) -> Option<&RequestFailure> {
        match self {
            Self::Exhausted(failure) => Some(failure),
            _ => None,
        }
    }
}
