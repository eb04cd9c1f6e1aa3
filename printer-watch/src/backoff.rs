//! Reconnection timing.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential backoff with jitter and an optional attempt limit.
///
/// Starts at `initial` and doubles after each call to `next_delay()`,
/// capping at `max`. Each returned delay is jittered to [0.5, 1.0) of the
/// nominal value so several watchers restarted together do not hammer the
/// printer in lockstep.
#[derive(Debug)]
pub struct ExponentialBackoff {
    current: Duration,
    initial: Duration,
    max: Duration,
    max_attempts: Option<u32>,
    attempts: u32,
    // RandomState is seeded from OS randomness at construction, so
    // different processes produce different jitter.
    jitter_state: RandomState,
    jitter_step: u64,
}

impl ExponentialBackoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            current: config.initial,
            initial: config.initial,
            max: config.max.max(config.initial),
            max_attempts: config.max_attempts,
            attempts: 0,
            jitter_state: RandomState::new(),
            jitter_step: 0,
        }
    }

    /// Return the next delay and advance the state, or `None` once the
    /// attempt limit is used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| self.attempts >= max) {
            return None;
        }
        self.attempts += 1;

        let nominal = self.current;
        self.current = (self.current * 2).min(self.max);

        let mut hasher = self.jitter_state.build_hasher();
        hasher.write_u64(self.jitter_step);
        self.jitter_step = self.jitter_step.wrapping_add(1);
        let hash = hasher.finish();
        let jitter = 0.5 + (hash as f64 / u64::MAX as f64) * 0.5;

        Some(nominal.mul_f64(jitter))
    }

    /// Attempts handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Back to the initial delay with the full attempt budget.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}
