//! The current bearer token, shared between one writer and many readers.
//!
//! The session loop owns the [`TokenStore`] and publishes every
//! `TokenRefresh` it receives. Requests hold [`TokenWatcher`]s, read the
//! current token when they start, and can wait for a newer one after a
//! 401 without polling.

use tandem_protocol::Token;
use tokio::sync::watch;
use tracing::{debug, info};

/// Write side. Not `Clone`: there is exactly one writer.
#[derive(Debug)]
pub struct TokenStore {
    tx: watch::Sender<Option<Token>>,
}

impl TokenStore {
    /// An empty store.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Replaces the current token wholesale.
    ///
    /// A token not newer than the current one is discarded and `false`
    /// returned.
    pub fn publish(&self, token: Token) -> bool {
        let issued_at = token.issued_at;
        let accepted = self.tx.send_if_modified(|current| match current {
            Some(existing) if existing.issued_at >= token.issued_at => false,
            _ => {
                *current = Some(token);
                true
            }
        });
        if accepted {
            info!(issued_at, "token refreshed");
        } else {
            debug!(issued_at, "stale token discarded");
        }
        accepted
    }

    /// Forgets the token, e.g. on logout.
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    /// The current token, if any.
    pub fn current(&self) -> Option<Token> {
        self.tx.borrow().clone()
    }

    /// A new read handle.
    pub fn watcher(&self) -> TokenWatcher {
        TokenWatcher {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of a [`TokenStore`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TokenWatcher {
    rx: watch::Receiver<Option<Token>>,
}

impl TokenWatcher {
    /// The current token, if any.
    pub fn current(&self) -> Option<Token> {
        self.rx.borrow().clone()
    }

    /// The current token if it was issued after `seen`. `seen == None`
    /// means no token was used, so any token counts as newer.
    pub fn newer_than_now(&self, seen: Option<u64>) -> Option<Token> {
        self.rx
            .borrow()
            .as_ref()
            .filter(|token| is_newer(token, seen))
            .cloned()
    }

    /// Waits until the store holds a token issued after `seen`.
    ///
    /// Returns `None` if the store is dropped first.
    pub async fn newer_than(&mut self, seen: Option<u64>) -> Option<Token> {
        let token = self
            .rx
            .wait_for(|current| current.as_ref().is_some_and(|token| is_newer(token, seen)))
            .await
            .ok()?;
        token.clone()
    }
}

fn is_newer(token: &Token, seen: Option<u64>) -> bool {
    seen.is_none_or(|seen| token.issued_at > seen)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_publish_discards_stale_tokens() {
        let store = TokenStore::new();
        assert!(store.publish(Token::new("a", 10)));
        assert!(!store.publish(Token::new("old", 5)));
        assert!(!store.publish(Token::new("same", 10)));
        assert_eq!(store.current(), Some(Token::new("a", 10)));
        assert!(store.publish(Token::new("b", 11)));
        assert_eq!(store.watcher().current(), Some(Token::new("b", 11)));
    }

    #[test]
    fn test_newer_than_now() {
        let store = TokenStore::new();
        let watcher = store.watcher();
        assert_eq!(watcher.newer_than_now(None), None);
        store.publish(Token::new("a", 10));
        assert_eq!(watcher.newer_than_now(None), Some(Token::new("a", 10)));
        assert_eq!(watcher.newer_than_now(Some(10)), None);
        assert_eq!(watcher.newer_than_now(Some(9)), Some(Token::new("a", 10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_than_waits_for_publish() {
        let store = TokenStore::new();
        store.publish(Token::new("a", 10));
        let mut watcher = store.watcher();

        let waiter = tokio::spawn(async move { watcher.newer_than(Some(10)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        store.publish(Token::new("b", 20));
        assert_eq!(waiter.await.unwrap(), Some(Token::new("b", 20)));
    }

    #[tokio::test]
    async fn test_newer_than_none_when_store_dropped() {
        let store = TokenStore::new();
        let mut watcher = store.watcher();
        drop(store);
        assert_eq!(watcher.newer_than(None).await, None);
    }

    #[test]
    fn test_clear_allows_any_token_again() {
        let store = TokenStore::new();
        store.publish(Token::new("a", 10));
        store.clear();
        assert_eq!(store.current(), None);
        assert!(store.publish(Token::new("b", 1)));
    }
}
