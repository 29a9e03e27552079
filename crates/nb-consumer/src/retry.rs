//! Retry scheduling policy
//!
//! Backoff is either a uniform number of seconds or an ordered
//! per-attempt schedule whose last value clamps. Attempts are 1-based:
//! `delay_ms(attempt)` is the delay applied before the given attempt.

use thiserror::Error;

#[derive(Error, Debug)]
#[error("backoff schedule must not be empty")]
pub struct EmptyScheduleError;

/// Backoff configuration for redeliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay, in seconds, before every attempt.
    Uniform(u64),
    /// Per-attempt delays in seconds; the last entry clamps.
    Schedule(Vec<u64>),
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Uniform(1)
    }
}

impl Backoff {
    pub fn uniform(seconds: u64) -> Self {
        Backoff::Uniform(seconds)
    }

    /// An ordered schedule. Empty schedules are rejected here so
    /// `delay_ms` is total.
    pub fn schedule(seconds: Vec<u64>) -> Result<Self, EmptyScheduleError> {
        if seconds.is_empty() {
            return Err(EmptyScheduleError);
        }
        Ok(Backoff::Schedule(seconds))
    }

    /// Delay in milliseconds before the 1-based `attempt`.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        match self {
            Backoff::Uniform(seconds) => seconds * 1000,
            Backoff::Schedule(schedule) => {
                let index =
                    (attempt.saturating_sub(1) as usize).min(schedule.len().saturating_sub(1));
                schedule.get(index).copied().unwrap_or(0) * 1000
            }
        }
    }
}

/// Position of an attempt within the allowed tries, for log/metric tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStage {
    First,
    Retry,
    Last,
}

impl RetryStage {
    /// Stage of 1-based `attempt` out of `tries`.
    pub fn of(attempt: u32, tries: u32) -> Self {
        if attempt >= tries {
            RetryStage::Last
        } else if attempt == 1 {
            RetryStage::First
        } else {
            RetryStage::Retry
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStage::First => "first",
            RetryStage::Retry => "retry",
            RetryStage::Last => "last",
        }
    }
}

/// What to do with a delivery whose handler failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    /// Republish through the delayed exchange with the incremented
    /// retry counter and computed delay.
    Redeliver { retry_count: u32, delay_ms: u64 },
    /// Attempts exhausted; route to the dead-letter queue.
    DeadLetter,
}

/// Decide the failure branch from the received `x-retry-count`, the
/// attempt bound, and the backoff policy.
pub fn failure_action(received_retry: u32, tries: u32, backoff: &Backoff) -> FailureAction {
    let next_retry = received_retry + 1;
    if next_retry < tries {
        FailureAction::Redeliver {
            retry_count: next_retry,
            delay_ms: backoff.delay_ms(next_retry),
        }
    } else {
        FailureAction::DeadLetter
    }
}
