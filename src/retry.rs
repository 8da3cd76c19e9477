//! Reconnect delay and timeout utilities.
//!
//! The helpers in this module are transport-agnostic; the session transport
//! uses them to pace reconnect attempts and bound each handshake.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Policy controlling the wait between reconnect attempts.
///
/// Reconnects are retried indefinitely; the policy only shapes the delay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay used before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound for exponential delay growth. Equal to `initial_delay`
    /// for a fixed delay.
    pub max_delay: Duration,
    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    /// Waits the same `delay` before every attempt.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            jitter: Duration::ZERO,
        }
    }

    /// Doubles the delay after each failed attempt, capped at `max_delay`.
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 1-based and counts consecutive failures since the last
    /// successful connection.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            if delay.is_zero() || delay >= self.max_delay {
                break;
            }
            delay = std::cmp::min(delay.saturating_mul(2), self.max_delay);
        }
        delay + jitter_duration(self.jitter, attempt)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(5000))
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
