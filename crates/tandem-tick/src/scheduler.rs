use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::{self, Instant as TokioInstant};
use tracing::{debug, trace, warn};

/// Configuration for the session tick.
#[derive(Debug, Clone)]
pub struct TickConfig {
    /// Ticks per second.
    pub tick_rate_hz: u32,
    /// Random delay (0..max µs) added to the first tick so that several
    /// clients started together do not tick in lockstep.
    pub initial_jitter_us: u64,
    /// Fraction of the tick period a tick's work may take before a warning
    /// is logged.
    pub budget_warn_threshold: f64,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 20,
            initial_jitter_us: 2_000,
            budget_warn_threshold: 0.80,
        }
    }
}

impl TickConfig {
    /// Highest supported rate.
    pub const MAX_TICK_RATE_HZ: u32 = 128;

    /// A config for `tick_rate_hz` with the other fields defaulted.
    pub fn with_rate(tick_rate_hz: u32) -> Self {
        Self {
            tick_rate_hz,
            ..Default::default()
        }
    }

    /// Clamps the rate to `1..=MAX_TICK_RATE_HZ` and the threshold to
    /// `0.0..=1.0`.
    pub fn validated(mut self) -> Self {
        let clamped = self.tick_rate_hz.clamp(1, Self::MAX_TICK_RATE_HZ);
        if clamped != self.tick_rate_hz {
            warn!(
                rate = self.tick_rate_hz,
                clamped, "tick_rate_hz out of range, clamping"
            );
            self.tick_rate_hz = clamped;
        }
        self.budget_warn_threshold = self.budget_warn_threshold.clamp(0.0, 1.0);
        self
    }

    /// Length of one tick. Assumes a validated config.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate_hz.max(1)))
    }
}

/// What [`TickScheduler::wait_for_tick`] reports about the tick that fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickInfo {
    /// Tick number, starting at 1.
    pub tick: u64,
    /// `true` if the tick woke more than 10% of a period late.
    pub late: bool,
    /// Whole periods missed because the previous tick ran long.
    pub skipped: u64,
}

/// Periodic tick for the session loop.
///
/// Meant to be one branch of a `tokio::select!`; a late tick never causes
/// a burst of catch-up ticks, the next one is scheduled a full period
/// after the late one fired.
#[derive(Debug)]
pub struct TickScheduler {
    config: TickConfig,
    period: Duration,
    tick_count: u64,
    next_tick: TokioInstant,
    tick_start: Option<Instant>,
}

impl TickScheduler {
    /// Creates a scheduler. The first tick is due one period (plus jitter)
    /// from now.
    pub fn new(config: TickConfig) -> Self {
        let config = config.validated();
        let period = config.tick_duration();
        let jitter = if config.initial_jitter_us > 0 {
            Duration::from_micros(rand::rng().random_range(0..config.initial_jitter_us))
        } else {
            Duration::ZERO
        };
        debug!(rate_hz = config.tick_rate_hz, ?period, "tick scheduler created");
        Self {
            config,
            period,
            tick_count: 0,
            next_tick: TokioInstant::now() + period + jitter,
            tick_start: None,
        }
    }

    /// A scheduler at `tick_rate_hz` with default settings.
    pub fn with_rate(tick_rate_hz: u32) -> Self {
        Self::new(TickConfig::with_rate(tick_rate_hz))
    }

    /// Waits for the next tick.
    ///
    /// Cancel-safe: if the future is dropped before it resolves, the
    /// deadline is unchanged and no tick is counted.
    pub async fn wait_for_tick(&mut self) -> TickInfo {
        time::sleep_until(self.next_tick).await;

        let now = TokioInstant::now();
        let late_by = now.saturating_duration_since(self.next_tick);
        let late = late_by > self.period / 10;
        let skipped = if late {
            (late_by.as_nanos() / self.period.as_nanos()) as u64
        } else {
            0
        };
        if skipped > 0 {
            warn!(
                tick = self.tick_count + 1,
                skipped,
                late_ms = late_by.as_secs_f64() * 1000.0,
                "session tick overran, skipping ahead"
            );
        }

        self.tick_count += 1;
        self.tick_start = Some(Instant::now());
        self.next_tick = now + self.period;
        trace!(tick = self.tick_count, late, "tick");

        TickInfo {
            tick: self.tick_count,
            late,
            skipped,
        }
    }

    /// Marks the end of the current tick's work and warns if it used more
    /// than the configured share of the period.
    pub fn record_tick_end(&mut self) {
        let Some(start) = self.tick_start.take() else {
            return;
        };
        let elapsed = start.elapsed();
        let utilization = elapsed.as_secs_f64() / self.period.as_secs_f64();
        if utilization >= self.config.budget_warn_threshold {
            warn!(
                tick = self.tick_count,
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                utilization_pct = format!("{:.1}", utilization * 100.0),
                "session tick approaching its budget"
            );
        }
    }

    /// Ticks fired so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Length of one tick.
    pub fn tick_duration(&self) -> Duration {
        self.period
    }

    /// Configured rate.
    pub fn tick_rate_hz(&self) -> u32 {
        self.config.tick_rate_hz
    }
}
