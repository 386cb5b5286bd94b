//! Timer-driven tests for the session tick, on paused tokio time.

use std::time::Duration;

use tandem_tick::{GuardSet, TickConfig, TickScheduler};

fn config_20hz() -> TickConfig {
    TickConfig {
        initial_jitter_us: 0,
        ..TickConfig::with_rate(20)
    }
}

#[test]
fn test_default_config_ticks_at_20hz() {
    let cfg = TickConfig::default();
    assert_eq!(cfg.tick_rate_hz, 20);
    assert_eq!(cfg.tick_duration(), Duration::from_millis(50));
}

#[test]
fn test_validated_clamps_rate() {
    assert_eq!(TickConfig::with_rate(0).validated().tick_rate_hz, 1);
    assert_eq!(
        TickConfig::with_rate(1_000).validated().tick_rate_hz,
        TickConfig::MAX_TICK_RATE_HZ
    );
}

#[test]
fn test_validated_clamps_threshold() {
    let cfg = TickConfig {
        budget_warn_threshold: 3.0,
        ..TickConfig::default()
    }
    .validated();
    assert_eq!(cfg.budget_warn_threshold, 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_tick_counts_up() {
    let mut s = TickScheduler::new(config_20hz());
    for expected in 1..=4 {
        let info = s.wait_for_tick().await;
        assert_eq!(info.tick, expected);
        assert!(!info.late);
        assert_eq!(info.skipped, 0);
    }
    assert_eq!(s.tick_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_first_tick_waits_one_period() {
    let mut s = TickScheduler::new(config_20hz());
    let early = tokio::time::timeout(Duration::from_millis(40), s.wait_for_tick()).await;
    assert!(early.is_err());
    // The cancelled wait left the deadline alone.
    assert_eq!(s.tick_count(), 0);
    let info = s.wait_for_tick().await;
    assert_eq!(info.tick, 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_tick_skips_instead_of_bursting() {
    let mut s = TickScheduler::new(config_20hz());
    s.wait_for_tick().await;

    // Block the loop for three and a half periods.
    tokio::time::advance(Duration::from_millis(225)).await;
    let info = s.wait_for_tick().await;
    assert!(info.late);
    assert_eq!(info.skipped, 3);

    // The next tick is a full period later, not immediate.
    let start = tokio::time::Instant::now();
    s.wait_for_tick().await;
    assert_eq!(start.elapsed(), Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn test_record_tick_end_without_tick_is_noop() {
    let mut s = TickScheduler::new(config_20hz());
    s.record_tick_end();
    s.wait_for_tick().await;
    s.record_tick_end();
    s.record_tick_end();
    assert_eq!(s.tick_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_guard_resolves_on_first_tick_condition_holds() {
    let mut s = TickScheduler::new(config_20hz());
    let mut guards = GuardSet::<u64>::new();
    let waiter = guards.register(|tick| *tick >= 3);

    let mut resolved_at = None;
    for _ in 0..5 {
        let info = s.wait_for_tick().await;
        if guards.check(&info.tick) > 0 {
            resolved_at.get_or_insert(info.tick);
        }
    }
    assert_eq!(resolved_at, Some(3));
    assert!(waiter.await.is_ok());
}
