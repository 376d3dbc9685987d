//! Backoff for requests that failed transiently.
//!
//! Whether a failure deserves another attempt depends on how far the request
//! got ([`FailurePoint`]). Segment opens only retry failures before the
//! response: a body that breaks off is resumed or skipped by the fetcher.
//! Whole-body fetches (playlists, keys) simply start over.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{FailurePoint, IngestError, Result};

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First pause; doubled for every further retry.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add up to half a base delay, never past `max_delay`.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Pause before retry number `attempt + 1`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(31))
            .min(self.max_delay);
        if !self.jitter {
            return delay;
        }
        let spread = (self.base_delay / 2).min(self.max_delay.saturating_sub(delay));
        let spread_us = u64::try_from(spread.as_micros()).unwrap_or(u64::MAX);
        if spread_us == 0 {
            return delay;
        }
        delay + Duration::from_micros(rand::rng().random_range(0..spread_us))
    }
}

/// Failures a [`Retry`] attempts again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOn {
    /// Only failures before a response arrived.
    Open,
    /// Any transient failure, repeating the whole request.
    Any,
}

/// One retried operation: a policy, the failures it covers and an optional
/// wall-clock deadline.
#[derive(Debug, Clone)]
pub struct Retry<'a> {
    policy: &'a RetryPolicy,
    retry_on: RetryOn,
    deadline: Option<Instant>,
}

impl<'a> Retry<'a> {
    pub fn new(policy: &'a RetryPolicy, retry_on: RetryOn) -> Self {
        Self {
            policy,
            retry_on,
            deadline: None,
        }
    }

    /// No retry starts after `deadline`; the last failure is returned.
    pub fn until(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn covers(&self, err: &IngestError, attempt: u32) -> bool {
        let point = match (err.failure_point(), self.retry_on) {
            (Some(FailurePoint::Open), _) => true,
            (Some(FailurePoint::Body), RetryOn::Any) => true,
            (Some(FailurePoint::Body), RetryOn::Open) | (None, _) => false,
        };
        point
            && attempt < self.policy.max_retries
            && self.deadline.is_none_or(|deadline| Instant::now() < deadline)
    }

    /// Run `operation` until it succeeds, fails permanently or the budget is
    /// spent. It receives the 0-based attempt number.
    pub async fn run<F, Fut, T>(&self, token: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(IngestError::Cancelled),
                result = operation(attempt) => result,
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !self.covers(&err, attempt) {
                return Err(err);
            }
            let delay = self.policy.delay_for_attempt(attempt);
            attempt += 1;
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(IngestError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32, jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter,
        }
    }

    #[test]
    fn delay_doubles_up_to_the_cap() {
        let policy = policy(10, false);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_below_half_a_base_delay() {
        let policy = policy(3, true);
        for _ in 0..32 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(150));
            assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_failures_are_retried() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let policy = policy(3, false);
        let result = Retry::new(&policy, RetryOn::Open)
            .run(&token, |_| {
                let n = attempts.fetch_add(1, Ordering::Relaxed);
                async move {
                    if n < 2 {
                        Err(IngestError::cannot_connect("http://x", "refused"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_bodies_only_restart_whole_fetches() {
        let token = CancellationToken::new();
        let policy = policy(2, false);

        let attempts = AtomicU32::new(0);
        let result: Result<()> = Retry::new(&policy, RetryOn::Open)
            .run(&token, |_| {
                attempts.fetch_add(1, Ordering::Relaxed);
                async { Err(IngestError::stream_reset("http://x", "eof")) }
            })
            .await;
        assert!(matches!(result, Err(IngestError::StreamReset { .. })));
        assert_eq!(attempts.load(Ordering::Relaxed), 1);

        let attempts = AtomicU32::new(0);
        let result: Result<()> = Retry::new(&policy, RetryOn::Any)
            .run(&token, |_| {
                attempts.fetch_add(1, Ordering::Relaxed);
                async { Err(IngestError::stream_reset("http://x", "eof")) }
            })
            .await;
        assert!(matches!(result, Err(IngestError::StreamReset { .. })));
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_ends_unbounded_retries() {
        let token = CancellationToken::new();
        let policy = policy(u32::MAX, false);
        let attempts = AtomicU32::new(0);
        let result: Result<()> = Retry::new(&policy, RetryOn::Open)
            .until(Instant::now() + Duration::from_secs(1))
            .run(&token, |_| {
                attempts.fetch_add(1, Ordering::Relaxed);
                async { Err(IngestError::cannot_connect("http://x", "refused")) }
            })
            .await;
        assert!(matches!(result, Err(IngestError::CannotConnect { .. })));
        // Attempts at 0, 100, 300, 700 and 1500 ms.
        assert_eq!(attempts.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn permanent_failures_and_cancellation_stop_at_once() {
        let token = CancellationToken::new();
        let policy = policy(5, false);
        let result: Result<()> = Retry::new(&policy, RetryOn::Any)
            .run(&token, |_| async { Err(IngestError::playlist("not a playlist")) })
            .await;
        assert!(matches!(result, Err(IngestError::Playlist { .. })));

        token.cancel();
        let result = Retry::new(&policy, RetryOn::Any)
            .run(&token, |_| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(IngestError::Cancelled)));
    }
}
