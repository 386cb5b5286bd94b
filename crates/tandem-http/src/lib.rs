//! HTTP control surface for Tandem.
//!
//! Three pieces:
//!
//! 1. **Token store** ([`TokenStore`] / [`TokenWatcher`]): the current
//!    bearer token. One writer, many readers; stale tokens are discarded.
//! 2. **Retry policy** ([`RetryPolicy`]): retries one logical request
//!    while its predicate allows. A 401 is retried only with a token
//!    newer than the rejected one, waiting for it if necessary.
//! 3. **API client** ([`ApiClient`]): the server's endpoints on top of
//!    `reqwest`, every call routed through the policy.
//!
//! When the policy gives up the caller gets
//! [`HttpError::Exhausted`] carrying a [`RequestFailure`] (attempts,
//! timestamps, last status, url) instead of a bare timeout.

mod api;
mod error;
mod retry;
mod token;

pub use api::{
    ApiClient, Identity, IdentityUpdate, JoinResponse, Library, ResourceScope, SessionStatus,
};
pub use error::HttpError;
pub use retry::{
    default_predicate, AttemptError, RequestFailure, RetryConfig, RetryContext, RetryPolicy,
    RetryPredicate,
};
pub use token::{TokenStore, TokenWatcher};
