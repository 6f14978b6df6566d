//! Exponential backoff with jitter for reconnect attempts.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use crate::config::LinkSettings;

/// Retry bookkeeping for the current outage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Automatic retries scheduled since the link was last open.
    pub attempt: u32,
    /// Delay chosen for the most recent retry.
    pub next_delay: Duration,
    pub max_attempts: u32,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        RetryState { attempt: 0, next_delay: Duration::ZERO, max_attempts }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_delay = Duration::ZERO;
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[derive(Debug)]
pub struct ReconnectScheduler {
    base_delay:    Duration,
    max_delay:     Duration,
    jitter_factor: f64,
    rng:           StdRng,
    /// When the scheduled retry is due.
    pending: Option<Instant>,
}

impl ReconnectScheduler {
    pub fn new(settings: &LinkSettings) -> Self {
        Self::with_rng(settings, StdRng::from_entropy())
    }

    /// Deterministic jitter, for tests.
    pub fn with_seed(settings: &LinkSettings, seed: u64) -> Self {
        Self::with_rng(settings, StdRng::seed_from_u64(seed))
    }

    fn with_rng(settings: &LinkSettings, rng: StdRng) -> Self {
        ReconnectScheduler {
            base_delay:    settings.base_delay,
            max_delay:     settings.max_delay,
            jitter_factor: settings.jitter_factor,
            rng,
            pending: None,
        }
    }

    /// Un-jittered delay for `attempt`: `min(base * 2^attempt, max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Schedule the next retry and return its delay, or `None` once
    /// `max_attempts` retries have been used up.
    pub fn schedule_next(&mut self, retry: &mut RetryState, now: Instant) -> Option<Duration> {
        if retry.exhausted() {
            self.pending = None;
            return None;
        }
        let base = self.backoff(retry.attempt);
        let jitter_ms = base.as_millis() as f64 * self.rng.gen::<f64>() * self.jitter_factor;
        let delay = base + Duration::from_millis(jitter_ms as u64);
        retry.attempt += 1;
        retry.next_delay = delay;
        self.pending = Some(now + delay);
        Some(delay)
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending
    }

    /// Consume the pending retry if it is due at `now`.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.pending {
            Some(due) if now >= due => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }
}
