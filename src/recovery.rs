// Telepress - Template-based telemetry compression
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Retry logic for persistence writes
//!
//! A write that fails with a transient error is retried according to a
//! [`RetryStrategy`]; once the strategy is exhausted the last error is
//! returned to the caller. Nothing is dropped silently.

use std::time::{Duration, Instant};

use crate::error::StoreError;
use crate::store::{Store, StoreOp};

/// Delay schedule for retrying a failed write
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// Constant delay between attempts
    Fixed {
        /// Retries after the first attempt
        max_retries: u32,
        /// Delay before every retry
        delay: Duration,
    },
    /// Delay multiplied by `multiplier` after every retry, capped at `max_delay`
    ExponentialBackoff {
        /// Retries after the first attempt
        max_retries: u32,
        /// Delay before the first retry
        initial_delay: Duration,
        /// Upper bound of any single delay
        max_delay: Duration,
        /// Growth factor per retry
        multiplier: f64,
    },
}

impl RetryStrategy {
    /// Delay before retry number `attempt` (0-indexed), `None` once the
    /// strategy is exhausted
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::Fixed { max_retries, delay } => (attempt < *max_retries).then_some(*delay),
            Self::ExponentialBackoff {
                max_retries,
                initial_delay,
                max_delay,
                multiplier,
            } => (attempt < *max_retries).then(|| {
                let factor = multiplier.max(1.0).powi(attempt.min(63) as i32);
                let secs = (initial_delay.as_secs_f64() * factor).min(max_delay.as_secs_f64());
                Duration::from_secs_f64(secs)
            }),
        }
    }

    /// Constant-delay strategy
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::Fixed { max_retries, delay }
    }

    /// Strategy for persistence writes: 5 retries from 10 ms, doubling up to 2 s
    pub fn persistence() -> Self {
        Self::ExponentialBackoff {
            max_retries: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

/// Result of a retry operation with metrics
#[derive(Debug, Clone, PartialEq)]
pub struct RetryResult<T> {
    /// The result value
    pub value: T,
    /// Number of attempts made
    pub attempts: u32,
    /// Total time spent, retries included
    pub total_duration: Duration,
}

/// Execute an operation, retrying only errors accepted by `retryable`
///
/// Sleeps between attempts; the last error is returned once the strategy
/// is exhausted or the error is not retryable.
///
/// # Example
///
/// ```
/// use telepress::recovery::{with_retry_if, RetryStrategy};
/// use std::time::Duration;
///
/// let strategy = RetryStrategy::fixed(3, Duration::from_millis(1));
/// let mut calls = 0;
/// let result = with_retry_if(&strategy, |e: &&str| *e == "busy", || {
///     calls += 1;
///     if calls < 3 { Err("busy") } else { Ok(calls) }
/// });
/// assert_eq!(result.map(|r| r.attempts), Ok(3));
/// ```
pub fn with_retry_if<T, E, F, P>(
    strategy: &RetryStrategy,
    retryable: P,
    mut operation: F,
) -> Result<RetryResult<T>, E>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
{
    let start = Instant::now();
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(value) => {
                return Ok(RetryResult {
                    value,
                    attempts: attempt + 1,
                    total_duration: start.elapsed(),
                })
            }
            Err(e) => match strategy.delay_for_attempt(attempt) {
                Some(delay) if retryable(&e) => {
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                _ => return Err(e),
            },
        }
    }
}

/// Apply `ops` to `store`, retrying transient failures
pub fn apply_with_retry<S: Store + ?Sized>(
    store: &S,
    ops: &[StoreOp],
    strategy: &RetryStrategy,
) -> Result<u32, StoreError> {
    let result = with_retry_if(strategy, StoreError::is_transient, || store.apply(ops));
    match &result {
        Ok(r) if r.attempts > 1 => {
            log::warn!(
                "persisted {} ops after {} attempts ({:?})",
                ops.len(),
                r.attempts,
                r.total_duration
            );
        }
        Err(e) => log::warn!("giving up on {} ops: {}", ops.len(), e),
        _ => {}
    }
    result.map(|r| r.attempts)
}
