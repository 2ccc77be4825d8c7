//! Retry decisions with exponential backoff
//!
//! `delay = base_delay * 2^attempt`, capped at `max_delay`.

use crate::message::DeliveryOutcome;
use std::time::Duration;

/// What to do with a message after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay
    RequeueAfter(Duration),
    /// Give up and route to the dead-letter exchange
    DeadLetter(String),
}

/// Channel-agnostic retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Backoff before the retry that follows attempt number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        // Clamped so the shift stays defined.
        let factor = 1u32 << attempt.min(31);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Decide the follow-up for `outcome` of attempt `attempt`.
    ///
    /// Returns `None` on success. A transient failure is retried while
    /// `attempt < max_retries`, so a message gets at most `max_retries + 1`
    /// attempts.
    pub fn next_action(
        &self,
        attempt: u32,
        max_retries: u32,
        outcome: &DeliveryOutcome,
    ) -> Option<RetryDecision> {
        match outcome {
            DeliveryOutcome::Success => None,
            DeliveryOutcome::PermanentFailure(reason) => {
                Some(RetryDecision::DeadLetter(format!("permanent failure: {reason}")))
            }
            DeliveryOutcome::TransientFailure(reason) => {
                if attempt < max_retries {
                    Some(RetryDecision::RequeueAfter(self.delay_for(attempt)))
                } else {
                    Some(RetryDecision::DeadLetter(format!(
                        "retries exhausted after {} transient failures, last: {reason}",
                        attempt + 1
                    )))
                }
            }
        }
    }
}
