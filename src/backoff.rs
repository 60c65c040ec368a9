//! Exponential backoff shared by the network-facing loops.
//!
//! Each loop that issues HTTP/WebSocket requests owns its own instance; the
//! state is never shared between loops.

use std::time::Duration;
use tokio::time::sleep;

const MIN_FAILURE_DELAY_MS: u64 = 200;
const MAX_FAILURE_DELAY_MS: u64 = 4000;
const BACKOFF_EXPONENT: f64 = 1.5;

/// Failure-delay state for a single retrying loop.
///
/// The delay starts at zero, jumps to 200 ms on the first failure, grows by
/// 1.5x per subsequent failure up to 4 s, and resets to zero on success.
#[derive(Debug)]
pub struct ExponentialBackoff {
    min_failure_delay_ms: u64,
    failure_delay_ms: u64,
    max_failure_delay_ms: u64,
    backoff_exponent: f64,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self {
            min_failure_delay_ms: MIN_FAILURE_DELAY_MS,
            failure_delay_ms: 0,
            max_failure_delay_ms: MAX_FAILURE_DELAY_MS,
            backoff_exponent: BACKOFF_EXPONENT,
        }
    }

    /// Current delay in milliseconds, without mutating state.
    pub fn failure_delay(&self) -> u64 {
        self.failure_delay_ms
    }

    /// Sleep for the current delay. A zero delay sleeps for the minimum.
    pub async fn sleep_after_fail(&mut self) {
        if self.failure_delay_ms == 0 {
            self.failure_delay_ms = self.min_failure_delay_ms;
        }
        sleep(Duration::from_millis(self.failure_delay_ms)).await;
    }

    /// Grow the delay after a failure.
    pub fn fail_increase(&mut self) {
        if self.failure_delay_ms == 0 {
            self.failure_delay_ms = self.min_failure_delay_ms;
            return;
        }

        self.failure_delay_ms = (self.failure_delay_ms as f64 * self.backoff_exponent) as u64;
        if self.failure_delay_ms > self.max_failure_delay_ms {
            self.failure_delay_ms = self.max_failure_delay_ms;
        }
    }

    /// Reset the delay after a success.
    pub fn success_reset(&mut self) {
        self.failure_delay_ms = 0;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}
