//! When to reconnect, and when to stop.

use std::time::Duration;

/// How a connection attempt or an open connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// The server closed with a normal closure. Terminal.
    Normal,
    /// The connect failed or the socket dropped. Transient.
    Abnormal,
}

/// What the supervisor should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after the delay.
    Retry(Duration),
    /// Stop; the session ended on purpose.
    Stop,
    /// Stop and report the connection as lost.
    GiveUp,
}

/// Counts connection attempts for one socket.
///
/// Every attempt counts, the first one included. A successful open
/// resets the count. Once `max_attempts` attempts have failed in a row
/// the policy gives up, and keeps giving up.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
            attempts: 0,
        }
    }

    /// Records the start of an attempt and returns its number (1-based).
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// The connection opened.
    pub fn on_open(&mut self) {
        self.attempts = 0;
    }

    /// Decides what follows a close.
    pub fn on_close(&self, kind: CloseKind) -> ReconnectDecision {
        match kind {
            CloseKind::Normal => ReconnectDecision::Stop,
            CloseKind::Abnormal if self.attempts >= self.max_attempts => ReconnectDecision::GiveUp,
            CloseKind::Abnormal => ReconnectDecision::Retry(self.delay),
        }
    }

    /// Attempts since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(500);

    #[test]
    fn test_on_close_normal_is_terminal() {
        let mut policy = ReconnectPolicy::new(DELAY, 10);
        policy.begin_attempt();
        assert_eq!(policy.on_close(CloseKind::Normal), ReconnectDecision::Stop);
    }

    #[test]
    fn test_on_close_gives_up_after_max_attempts_counting_the_first() {
        let mut policy = ReconnectPolicy::new(DELAY, 10);
        for _ in 0..9 {
            policy.begin_attempt();
            assert_eq!(policy.on_close(CloseKind::Abnormal), ReconnectDecision::Retry(DELAY));
        }
        assert_eq!(policy.begin_attempt(), 10);
        assert_eq!(policy.on_close(CloseKind::Abnormal), ReconnectDecision::GiveUp);
    }

    #[test]
    fn test_on_open_resets_the_count() {
        let mut policy = ReconnectPolicy::new(DELAY, 2);
        policy.begin_attempt();
        policy.begin_attempt();
        policy.on_open();
        assert_eq!(policy.attempts(), 0);
        policy.begin_attempt();
        assert_eq!(policy.on_close(CloseKind::Abnormal), ReconnectDecision::Retry(DELAY));
    }
}
