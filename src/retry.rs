//! Reconnect backoff policy.
//!
//! The session retries forever, so the policy only decides how long to wait
//! before each attempt. There is no jitter: delays are a pure function of the
//! retry index.

use std::time::Duration;

/// Default backoff constants used by [`ReconnectBackoff::default`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackoffDefaults;

impl BackoffDefaults {
    pub const INITIAL: Duration = Duration::from_millis(1_000);
    pub const MAX: Duration = Duration::from_millis(30_000);
}

/// Exponential reconnect backoff capped at `max`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReconnectBackoff {
    /// Delay used before the first retry.
    pub initial: Duration,
    /// Upper bound for delay growth.
    pub max: Duration,
}

impl ReconnectBackoff {
    /// Computes the delay to wait before the given retry.
    ///
    /// `retry` is 0-based: it is the number of retries already scheduled for
    /// the current target, read before the counter is incremented.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let Some(factor) = 1u32.checked_shl(retry) else {
            return self.max;
        };
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial: BackoffDefaults::INITIAL,
            max: BackoffDefaults::MAX,
        }
    }
}
