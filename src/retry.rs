//! Per-job retry and backoff policy.
//!
//! A [`RetryPolicy`] is attached to a job when it is enqueued and stays
//! fixed for the job's lifetime. It answers one question per failed
//! attempt: try again after some delay, or give up and move the job to the
//! dead set.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Shape of the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Delay doubles each attempt, starting from `base`.
    Exponential { base: Duration },
    /// Constant delay of `base` for every attempt.
    Fixed { base: Duration },
}

/// Attempt budget and backoff shape for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of delivery attempts allowed.
    pub max_attempts: u32,
    /// Delay strategy between attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(300_000),
            },
        }
    }
}

/// What to do with a job after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Reschedule, due after the given delay.
    Retry(Duration),
    /// Attempt budget exhausted; move to the dead set.
    Dead,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Delay before the next try once `attempt` attempts (1-indexed) have
    /// been made: `base * 2^(attempt - 1)` for exponential backoff, `base`
    /// for fixed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed { base } => base,
            Backoff::Exponential { base } => {
                let doublings = attempt.saturating_sub(1);
                let factor = 1u32.checked_shl(doublings).unwrap_or(u32::MAX);
                base.saturating_mul(factor)
            }
        }
    }

    /// Decide the fate of a job whose `attempts_made`-th attempt just
    /// failed with a retryable outcome. Failing the final allowed attempt
    /// is terminal.
    pub fn after_retryable(&self, attempts_made: u32) -> Verdict {
        if attempts_made >= self.max_attempts {
            Verdict::Dead
        } else {
            Verdict::Retry(self.delay_for(attempts_made))
        }
    }

    /// Read the default policy from the process environment
    /// (`MAX_ATTEMPTS`, `BACKOFF`, `BACKOFF_DELAY_MS`), falling back to
    /// the crate defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let base = Duration::from_millis(crate::config::env_parsed("BACKOFF_DELAY_MS", 300_000));
        let backoff = match crate::config::env_or("BACKOFF", "exponential").as_str() {
            "fixed" => Backoff::Fixed { base },
            _ => Backoff::Exponential { base },
        };
        Self {
            max_attempts: crate::config::env_parsed("MAX_ATTEMPTS", defaults.max_attempts),
            backoff,
        }
    }
}
