//! Bounded polling primitives.
//!
//! [`RetryablePredicate`] is the time-budgeted "wait until" used for socket
//! and node readiness. [`BoundedRetry`] is the fixed-attempt variant used by
//! post-boot verification, where each attempt is an expensive remote call and
//! the number of attempts matters more than the wall clock.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

/// Attempts made by the default socket readiness policy.
pub const DEFAULT_SOCKET_ATTEMPTS: u32 = 60;

/// Period between socket readiness attempts.
pub const DEFAULT_SOCKET_PERIOD: Duration = Duration::from_secs(1);

/// Attempts made by the default post-boot verification policy.
pub const DEFAULT_VERIFY_ATTEMPTS: u32 = 5;

/// Sleep between failed post-boot verification attempts.
pub const DEFAULT_VERIFY_BACKOFF: Duration = Duration::from_secs(10);

/// Re-evaluates a boolean test until it succeeds or a time budget runs out.
///
/// The predicate is a plain value: it keeps no state between calls, so the
/// same policy can be applied to any number of inputs, concurrently.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryablePredicate {
    max_duration: Duration,
    period: Duration,
}

impl RetryablePredicate {
    /// Creates a predicate with the given total budget and poll period.
    #[must_use]
    pub const fn new(max_duration: Duration, period: Duration) -> Self {
        Self {
            max_duration,
            period,
        }
    }

    /// Creates a predicate that allows `attempts` polls spaced by `period`.
    #[must_use]
    pub const fn from_attempts(attempts: u32, period: Duration) -> Self {
        Self::new(period.saturating_mul(attempts), period)
    }

    /// Default socket readiness policy: 60 attempts at one second intervals.
    #[must_use]
    pub const fn socket_default() -> Self {
        Self::from_attempts(DEFAULT_SOCKET_ATTEMPTS, DEFAULT_SOCKET_PERIOD)
    }

    /// Total time budget for a single [`RetryablePredicate::apply`] call.
    #[must_use]
    pub const fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Sleep between failed attempts.
    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }

    /// Evaluates `test` against `input` until it returns `true` or the budget
    /// is exhausted.
    ///
    /// Every evaluation is bounded by the remaining budget, so a test that
    /// never completes is abandoned rather than awaited forever. Exhaustion is
    /// reported as `false`; the predicate never fails in any other way.
    pub async fn apply<T, F, Fut>(&self, input: &T, mut test: F) -> bool
    where
        T: ?Sized,
        F: FnMut(&T) -> Fut,
        Fut: Future<Output = bool>,
    {
        // A budget past the end of the clock has no deadline.
        let deadline = Instant::now().checked_add(self.max_duration);
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let passed = match deadline {
                Some(end) => {
                    let remaining = end.saturating_duration_since(Instant::now());
                    if let Ok(passed) = timeout(remaining, test(input)).await {
                        passed
                    } else {
                        debug!(attempt, "predicate evaluation outlived the retry budget");
                        return false;
                    }
                }
                None => test(input).await,
            };
            if passed {
                return true;
            }

            if deadline.is_some_and(|end| Instant::now() >= end) {
                debug!(attempt, budget = ?self.max_duration, "retry budget exhausted");
                return false;
            }
            sleep(self.period).await;
            if deadline.is_some_and(|end| Instant::now() > end) {
                debug!(attempt, budget = ?self.max_duration, "retry budget exhausted");
                return false;
            }
        }
    }
}

impl Default for RetryablePredicate {
    fn default() -> Self {
        Self::socket_default()
    }
}

/// Retries a fallible operation a fixed number of times with a fixed backoff.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BoundedRetry {
    attempts: u32,
    backoff: Duration,
}

impl BoundedRetry {
    /// Creates a policy; zero attempts is treated as one.
    #[must_use]
    pub const fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: if attempts == 0 { 1 } else { attempts },
            backoff,
        }
    }

    /// Maximum number of attempts.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Sleep between failed attempts.
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Runs `operation` until it succeeds or the attempts are used up.
    ///
    /// The closure receives the one-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns the error produced by the final attempt.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.attempts => return Err(err),
                Err(_) => {
                    debug!(attempt, backoff = ?self.backoff, "attempt failed; backing off");
                    sleep(self.backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for BoundedRetry {
    fn default() -> Self {
        Self::new(DEFAULT_VERIFY_ATTEMPTS, DEFAULT_VERIFY_BACKOFF)
    }
}
