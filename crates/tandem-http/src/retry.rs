//! Retry policy for one logical HTTP request.
//!
//! ```text
//! attempt ──ok──► done
//!    │
//!    ├─ 401 ──► newer token in store? ──yes──► retry now
//!    │                  │ no
//!    │                  └─► wait for one (bounded) ──► retry once
//!    │
//!    └─ other ──► backoff ──► retry
//!
//! every retry first asks the predicate; a refusal ends in RequestFailure
//! ```

use std::fmt;
use std::future::Future;
use std::time::{Duration, SystemTime};

use tandem_protocol::Token;
use tracing::{debug, info, warn};

use crate::{HttpError, TokenWatcher};

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

/// Retry settings shared by every request of an [`ApiClient`](crate::ApiClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts per logical request, the first one included.
    pub max_attempts: u32,

    /// Wait before retrying a non-auth failure.
    pub backoff: Duration,

    /// Upper bound on waiting for a fresh token after a 401. `None` waits
    /// for as long as the token store lives.
    pub token_wait_timeout: Option<Duration>,
}

impl RetryConfig {
    /// Sets the attempt limit.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the backoff.
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the token wait bound.
    pub fn token_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.token_wait_timeout = timeout;
        self
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
            token_wait_timeout: Some(Duration::from_secs(30)),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryContext / RequestFailure
// ---------------------------------------------------------------------------

/// Decides whether another attempt may start.
pub type RetryPredicate = fn(&RetryContext) -> bool;

/// Retry while fewer than `max_attempts` attempts have been made.
pub fn default_predicate(ctx: &RetryContext) -> bool {
    ctx.attempt_count < ctx.max_attempts
}

/// Book-keeping for one logical request.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempts made so far. Only ever increases.
    pub attempt_count: u32,
    /// When the first attempt started.
    pub first_attempt: SystemTime,
    /// Configured attempt limit.
    pub max_attempts: u32,
    /// Status of the most recent failed attempt, if it got a response.
    pub last_status: Option<u16>,
    predicate: RetryPredicate,
}

impl RetryContext {
    fn new(max_attempts: u32, predicate: RetryPredicate) -> Self {
        Self {
            attempt_count: 0,
            first_attempt: SystemTime::now(),
            max_attempts,
            last_status: None,
            predicate,
        }
    }

    /// `true` if the predicate allows another attempt.
    pub fn should_retry(&self) -> bool {
        (self.predicate)(self)
    }

    fn failure(&self, url: &str) -> RequestFailure {
        RequestFailure {
            attempt_count: self.attempt_count,
            first_attempt: self.first_attempt,
            timestamp: SystemTime::now(),
            last_status: self.last_status,
            url: url.to_owned(),
        }
    }
}

/// Why a request was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFailure {
    /// Attempts made.
    pub attempt_count: u32,
    /// When the first attempt started.
    pub first_attempt: SystemTime,
    /// When the request was abandoned.
    pub timestamp: SystemTime,
    /// Status of the last attempt; `None` if it never got a response.
    pub last_status: Option<u16>,
    /// The request url.
    pub url: String,
}

impl fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed after {} attempt(s)", self.url, self.attempt_count)?;
        match self.last_status {
            Some(status) => write!(f, ", last status {status}"),
            None => write!(f, ", no response"),
        }
    }
}

// ---------------------------------------------------------------------------
// AttemptError
// ---------------------------------------------------------------------------

/// How a single physical attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// 401: the token was rejected.
    Unauthorized,
    /// Any other non-success status.
    Status(u16),
    /// No response: connect, timeout, or body errors.
    Transport(String),
}

impl AttemptError {
    fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized => Some(401),
            Self::Status(status) => Some(*status),
            Self::Transport(_) => None,
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Status(status) => write!(f, "status {status}"),
            Self::Transport(reason) => write!(f, "transport: {reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Runs a request, retrying according to [`RetryConfig`] and the token
/// store.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    tokens: TokenWatcher,
    predicate: RetryPredicate,
}

impl RetryPolicy {
    /// A policy using [`default_predicate`].
    pub fn new(config: RetryConfig, tokens: TokenWatcher) -> Self {
        Self {
            config,
            tokens,
            predicate: default_predicate,
        }
    }

    /// Replaces the retry predicate.
    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// The config.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `attempt` until it succeeds or the policy gives up.
    ///
    /// `attempt` receives the token to send, or `None` if the store is
    /// empty. After a 401 the next attempt runs only with a token issued
    /// after the rejected one, and only once per such token.
    pub async fn run<T, F, Fut>(&self, url: &str, mut attempt: F) -> Result<T, HttpError>
    where
        F: FnMut(Option<Token>) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let mut ctx = RetryContext::new(self.config.max_attempts, self.predicate);
        let mut tokens = self.tokens.clone();
        let mut token = tokens.current();

        loop {
            ctx.attempt_count += 1;
            let sent = token.as_ref().map(|t| t.issued_at);
            let err = match attempt(token.take()).await {
                Ok(value) => {
                    if ctx.attempt_count > 1 {
                        info!(url, attempts = ctx.attempt_count, "request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };
            ctx.last_status = err.status();
            warn!(url, attempt = ctx.attempt_count, error = %err, "request attempt failed");

            if !ctx.should_retry() {
                return Err(HttpError::Exhausted(ctx.failure(url)));
            }

            token = match err {
                AttemptError::Unauthorized => match tokens.newer_than_now(sent) {
                    Some(fresh) => {
                        debug!(url, issued_at = fresh.issued_at, "newer token already stored");
                        Some(fresh)
                    }
                    None => {
                        debug!(url, ?sent, "waiting for a newer token");
                        match self.wait_for_token(&mut tokens, sent).await {
                            Some(fresh) => Some(fresh),
                            None => {
                                warn!(url, "no newer token arrived, giving up");
                                return Err(HttpError::Exhausted(ctx.failure(url)));
                            }
                        }
                    }
                },
                AttemptError::Status(_) | AttemptError::Transport(_) => {
                    tokio::time::sleep(self.config.backoff).await;
                    tokens.current()
                }
            };
        }
    }

    async fn wait_for_token(&self, tokens: &mut TokenWatcher, sent: Option<u64>) -> Option<Token> {
        match self.config.token_wait_timeout {
            Some(limit) => tokio::time::timeout(limit, tokens.newer_than(sent))
                .await
                .ok()
                .flatten(),
            None => tokens.newer_than(sent).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::time::Instant;

    use super::*;
    use crate::TokenStore;

    fn policy(store: &TokenStore) -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::default().backoff(Duration::from_millis(100)),
            store.watcher(),
        )
    }

    #[test]
    fn test_default_predicate_allows_three_attempts() {
        let mut ctx = RetryContext::new(3, default_predicate);
        ctx.attempt_count = 2;
        assert!(ctx.should_retry());
        ctx.attempt_count = 3;
        assert!(!ctx.should_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exhausts_after_three_attempts() {
        let store = TokenStore::new();
        let calls = Arc::new(Mutex::new(0u32));
        let result: Result<(), _> = policy(&store)
            .run("http://api/x", |_| {
                let calls = Arc::clone(&calls);
                async move {
                    *calls.lock().unwrap() += 1;
                    Err(AttemptError::Status(503))
                }
            })
            .await;

        let HttpError::Exhausted(failure) = result.unwrap_err() else {
            panic!("expected exhaustion");
        };
        assert_eq!(failure.attempt_count, 3);
        assert_eq!(failure.last_status, Some(503));
        assert_eq!(failure.url, "http://api/x");
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_401_waits_for_newer_token_then_retries_once() {
        let store = TokenStore::new();
        store.publish(Token::new("old", 100));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let policy = policy(&store);
        let run = {
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                policy
                    .run("http://api/join", move |token| {
                        let seen = Arc::clone(&seen);
                        async move {
                            let token = token.expect("token");
                            seen.lock().unwrap().push((token.value.clone(), Instant::now()));
                            if token.value == "old" {
                                Err(AttemptError::Unauthorized)
                            } else {
                                Ok(token.value)
                            }
                        }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(seen.lock().unwrap().len(), 1, "no retry before a newer token");
        store.publish(Token::new("fresh", 200));

        assert_eq!(run.await.unwrap().unwrap(), "fresh");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].0, "fresh");
        assert!(seen[1].1 - start >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_401_with_newer_token_already_stored_retries_immediately() {
        let store = TokenStore::new();
        store.publish(Token::new("old", 100));
        let policy = policy(&store);
        let start = Instant::now();

        let result = policy
            .run("http://api/identity", |token| {
                let token = token.expect("token");
                // The refresh lands while the first attempt is in flight.
                if token.value == "old" {
                    store.publish(Token::new("new", 150));
                }
                async move {
                    match token.value.as_str() {
                        "old" => Err(AttemptError::Unauthorized),
                        _ => Ok(token.issued_at),
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 150);
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_401_token_wait_times_out() {
        let store = TokenStore::new();
        store.publish(Token::new("old", 100));
        let policy = RetryPolicy::new(
            RetryConfig::default().token_wait_timeout(Some(Duration::from_secs(5))),
            store.watcher(),
        );

        let result: Result<(), _> = policy
            .run("http://api/join", |_| async { Err(AttemptError::Unauthorized) })
            .await;

        let HttpError::Exhausted(failure) = result.unwrap_err() else {
            panic!("expected exhaustion");
        };
        assert_eq!(failure.attempt_count, 1);
        assert_eq!(failure.last_status, Some(401));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_predicate_overrides_attempt_limit() {
        let store = TokenStore::new();
        let policy = policy(&store).with_predicate(|_| false);
        let result: Result<(), _> = policy
            .run("http://api/x", |_| async { Err(AttemptError::Transport("refused".into())) })
            .await;
        let HttpError::Exhausted(failure) = result.unwrap_err() else {
            panic!("expected exhaustion");
        };
        assert_eq!(failure.attempt_count, 1);
        assert_eq!(failure.last_status, None);
    }
}
