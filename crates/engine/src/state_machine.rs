//! Processing state machine shared by external events and notification requests
//!
//! Both record kinds carry a [`RetryState`] and settle the result of one attempt the
//! same way:
//!
//! - success: the record's completion status is set (PROCESSED for events, SENT or
//!   DELIVERED for notifications)
//! - ignored: terminal IGNORED (events only; unknown types are not errors)
//! - failure: `retry_count += 1`, error captured; while budget remains the next attempt
//!   is scheduled at `now + base * 2^attempt`, otherwise the row is terminally FAILED
//!
//! `attempt` is the number of failures recorded before this one, so with the default
//! one-minute base the schedule is 1, 2, 4 ... minutes.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::error::EngineError;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Highest exponent used for backoff; keeps `2^n` inside an i32
const MAX_BACKOFF_EXPONENT: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::minutes(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `retry_count` earlier failures
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 1i32 << retry_count.min(MAX_BACKOFF_EXPONENT);
        self.base_delay.saturating_mul(factor)
    }
}

/// Retry bookkeeping embedded in every processable record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

impl RetryState {
    pub fn new(max_retries: u32) -> Self {
        Self {
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            last_error: None,
        }
    }

    pub fn has_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Eligible for the retry drain at `now`
    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.has_budget() && self.next_retry_at.is_some_and(|at| at <= now)
    }
}

/// Result of one processing attempt, before it is applied to the record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<C> {
    Completed(C),
    Ignored(String),
    Failed { error: String, retryable: bool },
}

impl<C> Outcome<C> {
    pub fn failed(error: &EngineError) -> Self {
        Outcome::Failed {
            error: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

/// What happened to the record once the outcome was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Settlement {
    Completed,
    Ignored,
    RetryScheduled { attempt: u32, at: OffsetDateTime },
    Exhausted { attempts: u32 },
}

impl Settlement {
    pub fn is_success(&self) -> bool {
        matches!(self, Settlement::Completed | Settlement::Ignored)
    }
}

/// What happened when a caller asked for one record to be run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Attempt {
    Settled(Settlement),
    /// Another worker holds the record, or it is no longer eligible
    Skipped,
}

impl Attempt {
    pub fn settlement(&self) -> Option<Settlement> {
        match self {
            Attempt::Settled(s) => Some(*s),
            Attempt::Skipped => None,
        }
    }
}

/// A record driven by [`settle`]
pub trait Processable {
    /// Data recorded on success (nothing for events, the delivery receipt for
    /// notifications)
    type Completion;

    fn retry_state(&self) -> &RetryState;
    fn retry_state_mut(&mut self) -> &mut RetryState;

    fn mark_completed(&mut self, completion: Self::Completion, now: OffsetDateTime);
    fn mark_ignored(&mut self, reason: &str, now: OffsetDateTime);
    fn mark_failed(&mut self, now: OffsetDateTime);
}

/// Apply the outcome of one attempt to `record`
pub fn settle<R: Processable>(
    record: &mut R,
    outcome: Outcome<R::Completion>,
    policy: &RetryPolicy,
    now: OffsetDateTime,
) -> Settlement {
    match outcome {
        Outcome::Completed(completion) => {
            record.retry_state_mut().next_retry_at = None;
            record.mark_completed(completion, now);
            Settlement::Completed
        }
        Outcome::Ignored(reason) => {
            record.retry_state_mut().next_retry_at = None;
            record.mark_ignored(&reason, now);
            Settlement::Ignored
        }
        Outcome::Failed { error, retryable } => {
            let state = record.retry_state_mut();
            let attempt = state.retry_count;
            state.retry_count = attempt.saturating_add(1);
            state.last_error = Some(error);

            let settlement = if retryable && state.has_budget() {
                let at = now + policy.backoff_delay(attempt);
                state.next_retry_at = Some(at);
                Settlement::RetryScheduled {
                    attempt: state.retry_count,
                    at,
                }
            } else {
                state.next_retry_at = None;
                Settlement::Exhausted {
                    attempts: state.retry_count,
                }
            };

            record.mark_failed(now);
            settlement
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Probe {
        retry: RetryState,
        status: &'static str,
    }

    impl Processable for Probe {
        type Completion = ();

        fn retry_state(&self) -> &RetryState {
            &self.retry
        }

        fn retry_state_mut(&mut self) -> &mut RetryState {
            &mut self.retry
        }

        fn mark_completed(&mut self, _: (), _: OffsetDateTime) {
            self.status = "done";
        }

        fn mark_ignored(&mut self, _: &str, _: OffsetDateTime) {
            self.status = "ignored";
        }

        fn mark_failed(&mut self, _: OffsetDateTime) {
            self.status = "failed";
        }
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    fn transient() -> Outcome<()> {
        Outcome::Failed {
            error: "boom".to_string(),
            retryable: true,
        }
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::minutes(1));
        assert_eq!(policy.backoff_delay(1), Duration::minutes(2));
        assert_eq!(policy.backoff_delay(2), Duration::minutes(4));
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy::default();
        assert!(policy.backoff_delay(200) >= policy.backoff_delay(30));
    }

    #[test]
    fn test_failure_schedules_retry_until_budget_exhausted() {
        let policy = RetryPolicy::default();
        let mut probe = Probe {
            retry: RetryState::new(3),
            status: "processing",
        };

        let first = settle(&mut probe, transient(), &policy, now());
        assert_eq!(
            first,
            Settlement::RetryScheduled {
                attempt: 1,
                at: now() + Duration::minutes(1)
            }
        );
        assert_eq!(probe.status, "failed");

        let second = settle(&mut probe, transient(), &policy, now());
        assert_eq!(
            second,
            Settlement::RetryScheduled {
                attempt: 2,
                at: now() + Duration::minutes(2)
            }
        );

        let third = settle(&mut probe, transient(), &policy, now());
        assert_eq!(third, Settlement::Exhausted { attempts: 3 });
        assert_eq!(probe.retry.retry_count, 3);
        assert!(probe.retry.next_retry_at.is_none());
        assert!(!probe.retry.is_due(now() + Duration::days(1)));
    }

    #[test]
    fn test_non_retryable_failure_is_terminal() {
        let mut probe = Probe {
            retry: RetryState::new(3),
            status: "processing",
        };
        let settlement = settle(
            &mut probe,
            Outcome::Failed {
                error: "not configured".into(),
                retryable: false,
            },
            &RetryPolicy::default(),
            now(),
        );
        assert_eq!(settlement, Settlement::Exhausted { attempts: 1 });
        assert!(probe.retry.next_retry_at.is_none());
        assert_eq!(probe.retry.last_error.as_deref(), Some("not configured"));
    }

    #[test]
    fn test_success_clears_schedule() {
        let mut probe = Probe {
            retry: RetryState {
                retry_count: 1,
                max_retries: 3,
                next_retry_at: Some(now()),
                last_error: Some("boom".into()),
            },
            status: "processing",
        };
        let settlement = settle(&mut probe, Outcome::Completed(()), &RetryPolicy::default(), now());
        assert_eq!(settlement, Settlement::Completed);
        assert_eq!(probe.status, "done");
        assert!(probe.retry.next_retry_at.is_none());
    }

    #[test]
    fn test_is_due() {
        let mut state = RetryState::new(3);
        assert!(!state.is_due(now()), "never failed, nothing scheduled");

        state.retry_count = 1;
        state.next_retry_at = Some(now() + Duration::minutes(1));
        assert!(!state.is_due(now()));
        assert!(state.is_due(now() + Duration::minutes(1)));

        state.retry_count = 3;
        assert!(!state.is_due(now() + Duration::minutes(1)));
    }
}
