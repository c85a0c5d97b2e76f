//! Bounded retry
//!
//! A [`RetryPolicy`] is a plain value describing an exponential backoff
//! schedule with a fixed number of attempts. It drives a single operation
//! until it succeeds, the predicate rejects an error, or the attempts run out.

use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::future::BoxFuture;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Exponential backoff with a bounded number of attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub initial_interval: Duration,
    /// Growth factor applied to the delay after each failure
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction of it
    pub jitter: f64,
    /// Total number of attempts, including the first one
    pub steps: u32,
    /// Upper bound for a single delay
    pub cap: Duration,
}

impl Default for RetryPolicy {
    /// Matches the Kubernetes client's default backoff: 10ms, x5, 10% jitter, 4 steps.
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(10),
            multiplier: 5.0,
            jitter: 0.1,
            steps: 4,
            cap: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The predicate classified the error as not worth retrying.
    #[error("{0}")]
    Permanent(E),

    /// Every attempt failed. Carries the last error.
    #[error("giving up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl RetryPolicy {
    pub fn new(initial_interval: Duration, multiplier: f64, steps: u32) -> Self {
        Self {
            initial_interval,
            multiplier,
            steps,
            ..Self::default()
        }
    }

    /// Same schedule without random spread.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    fn backoff(&self) -> StepBackoff {
        StepBackoff::new(self)
    }

    /// Run `operation` against `state` until it succeeds or the policy gives up.
    ///
    /// `should_retry` decides per error whether another attempt is made.
    /// Each retry sleeps for the next backoff delay.
    pub async fn run<S, T, E, F, P>(
        &self,
        state: &mut S,
        mut operation: F,
        should_retry: P,
    ) -> Result<T, RetryError<E>>
    where
        S: ?Sized,
        F: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T, E>>,
        P: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let mut backoff = self.backoff();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let err = match operation(&mut *state).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !should_retry(&err) {
                return Err(RetryError::Permanent(err));
            }

            match backoff.next_backoff() {
                Some(delay) => {
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(RetryError::Exhausted { attempts, last: err }),
            }
        }
    }
}

/// [`ExponentialBackoff`] limited to a number of steps instead of elapsed time.
struct StepBackoff {
    inner: ExponentialBackoff,
    steps: u32,
    remaining: u32,
}

impl StepBackoff {
    fn new(policy: &RetryPolicy) -> Self {
        let steps = policy.steps.max(1);
        Self {
            inner: ExponentialBackoff {
                current_interval: policy.initial_interval,
                initial_interval: policy.initial_interval,
                randomization_factor: policy.jitter,
                multiplier: policy.multiplier,
                max_interval: policy.cap,
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            },
            steps,
            remaining: steps,
        }
    }
}

impl Backoff for StepBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining <= 1 {
            return None;
        }
        self.remaining -= 1;
        self.inner.next_backoff()
    }

    fn reset(&mut self) {
        self.remaining = self.steps;
        self.inner.reset();
    }
}
