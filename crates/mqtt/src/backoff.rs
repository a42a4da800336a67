//! Reconnect/retry policy with exponential backoff.
//!
//! When a connected session loses its transport, the kernel asks the policy
//! whether to try again and how long to wait first. Delays grow exponentially
//! up to a cap:
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay) ± jitter
//! ```
//!
//! With the default settings (initial=1s, multiplier=2.0, max=60s):
//! - Attempt 1: wait 1s
//! - Attempt 2: wait 2s
//! - Attempt 3: wait 4s
//! - ...
//! - Attempt 7+: wait 60s (capped)
//!
//! The policy gives up when a configured attempt limit or elapsed-time budget
//! is exhausted, or immediately when the disconnect reason is one that no
//! amount of retrying can fix (a broker refusing our credentials).
//!
//! # Examples
//!
//! ```ignore
//! use std::time::Duration;
//! use device_mqtt::backoff::{Backoff, RetryDecision};
//!
//! let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 2.0);
//! backoff.set_max_attempts(3);
//!
//! match backoff.decide(&reason) {
//!     RetryDecision::Retry(delay) => { /* arm a timer */ }
//!     RetryDecision::GiveUp(err) => { /* surface ConnectionLost */ }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;

use crate::{config::ReconnectConfig, state::DisconnectReason};

const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Why the policy stopped retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    /// Maximum retry attempts exceeded with the given limit.
    #[error("Maximum number of attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),

    /// The retry budget measured from the first failure ran out.
    #[error("Maximum reconnect time exceeded: {0:?}")]
    MaxElapsedExceeded(Duration),

    /// The disconnect reason is permanent; retrying cannot help.
    #[error("Permanent failure, not retrying: {0}")]
    Fatal(String),
}

/// Outcome of consulting the policy after a disconnect.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Wait this long, then attempt a reconnect.
    Retry(Duration),
    /// Stop; the session surfaces `ConnectionLost`.
    GiveUp(BackoffError),
}

/// Exponential backoff controller for reconnect attempts.
///
/// Each call to [`Backoff::next_sleep`] counts one attempt. The counter and
/// the delay go back to their initial values on [`Backoff::reset`], which the
/// kernel calls after every successful CONNACK.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// The initial delay before the first retry.
    initial_delay: Duration,

    /// The delay returned by the next call to `next_sleep`.
    current_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplicative factor applied to the delay after each attempt.
    multiplier: f64,

    /// Fraction of the delay used as symmetric random jitter (0.0 disables).
    jitter: f64,

    /// Count of attempted retries since the last reset.
    attempt: u32,

    /// Optional hard limit on retry attempts. `None` retries forever.
    max_attempts: Option<u32>,

    /// Optional budget measured from the first failure after a reset.
    max_elapsed: Option<Duration>,

    /// When the current run of failures started.
    first_failure_at: Option<Instant>,
}

impl Backoff {
    /// Creates a new backoff controller without attempt or time limits.
    ///
    /// A `multiplier` below 1.0 is clamped to 1.0 (constant delay); a
    /// non-finite one falls back to 2.0.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let max = max.max(initial);
        let multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            DEFAULT_MULTIPLIER
        };
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max,
            multiplier,
            jitter: 0.0,
            attempt: 0,
            max_attempts: None,
            max_elapsed: None,
            first_failure_at: None,
        }
    }

    /// Builds the policy from configuration. Zero limits mean unlimited.
    pub fn from_config(config: &ReconnectConfig) -> Self {
        let mut backoff = Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.multiplier,
        );
        backoff.set_jitter(config.jitter);
        if config.max_attempts > 0 {
            backoff.set_max_attempts(config.max_attempts);
        }
        if config.max_elapsed_secs > 0 {
            backoff.set_max_elapsed(Duration::from_secs(config.max_elapsed_secs));
        }
        backoff
    }

    /// Sets an explicit maximum number of attempts.
    pub fn set_max_attempts(&mut self, max: u32) {
        self.max_attempts = Some(max);
    }

    /// Sets the time budget after which the policy stops retrying.
    pub fn set_max_elapsed(&mut self, max: Duration) {
        self.max_elapsed = Some(max);
    }

    /// Sets the jitter fraction, clamped to `0.0..=1.0`. NaN disables jitter.
    pub fn set_jitter(&mut self, jitter: f64) {
        self.jitter = if jitter.is_nan() {
            0.0
        } else {
            jitter.clamp(0.0, 1.0)
        };
    }

    /// Resets the backoff to its initial state.
    ///
    /// Call this when a connection succeeds, so the next failure starts with
    /// the minimum delay again.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
        self.first_failure_at = None;
    }

    /// Decides what to do after a disconnect with the given reason.
    pub fn decide(&mut self, reason: &DisconnectReason) -> RetryDecision {
        if reason.is_permanent() {
            return RetryDecision::GiveUp(BackoffError::Fatal(reason.to_string()));
        }

        match self.next_sleep() {
            Ok(delay) => RetryDecision::Retry(delay),
            Err(e) => RetryDecision::GiveUp(e),
        }
    }

    /// Returns the next sleep duration and advances the backoff timer.
    ///
    /// # Returns
    /// - `Ok(Duration)`: The sleep duration before the next retry attempt
    /// - `Err(BackoffError)`: If the attempt limit or time budget is exhausted
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        let now = Instant::now();
        let started = *self.first_failure_at.get_or_insert(now);

        if let Some(max_elapsed) = self.max_elapsed {
            if now.duration_since(started) >= max_elapsed {
                return Err(BackoffError::MaxElapsedExceeded(max_elapsed));
            }
        }

        self.attempt += 1;
        if let Some(max) = self.max_attempts {
            if self.attempt > max {
                return Err(BackoffError::MaxAttemptLimitError(max));
            }
        }

        let sleep = self.apply_jitter(self.current_delay);

        // Calculate next delay: current * multiplier, capped at max
        let next_delay_secs = self.current_delay.as_secs_f64() * self.multiplier;
        self.current_delay = Duration::from_secs_f64(next_delay_secs).min(self.max_delay);

        Ok(sleep)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_secs_f64(delay.as_secs_f64() * factor).min(self.max_delay)
    }

    /// Gets the configured maximum delay.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Gets the explicit maximum attempts limit, if set.
    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Gets the current attempt count.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Gets the delay (before jitter) that the next sleep will be based on.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

impl Default for Backoff {
    /// 1 second initial delay, doubling, capped at 60 seconds, no limits.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), DEFAULT_MULTIPLIER)
    }
}
