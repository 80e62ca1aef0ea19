use std::time::{Duration, Instant};

use crate::config::RestartConfig;

/// Adaptive delay between graph restarts.
///
/// Restarts closer together than `window` build a streak, capped at
/// `max_streak`. Once the streak passes one, every restart waits `backoff`
/// before the branches are brought back; a quiet window resets it.
#[derive(Debug, Clone)]
pub struct RestartPacer {
    window: Duration,
    max_streak: u32,
    backoff: Duration,
    streak: u32,
    last: Option<Instant>,
}

impl RestartPacer {
    pub fn new(window: Duration, max_streak: u32, backoff: Duration) -> Self {
        Self {
            window,
            max_streak,
            backoff,
            streak: 0,
            last: None,
        }
    }

    pub fn from_config(config: &RestartConfig) -> Self {
        Self::new(
            Duration::from_millis(config.window_ms),
            config.max_streak,
            Duration::from_millis(config.backoff_ms),
        )
    }

    pub fn next_delay(&mut self, now: Instant) -> Duration {
        self.streak = match self.last {
            Some(last) if now.saturating_duration_since(last) < self.window => {
                (self.streak + 1).min(self.max_streak)
            }
            _ => 0,
        };
        self.last = Some(now);

        if self.streak > 1 {
            self.backoff
        } else {
            Duration::ZERO
        }
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn reset(&mut self) {
        self.streak = 0;
        self.last = None;
    }
}

impl Default for RestartPacer {
    fn default() -> Self {
        Self::from_config(&RestartConfig::default())
    }
}
