//! Caller-side resilience for fetch callbacks.
//!
//! The runner itself invokes each callback exactly once. Retries and per-item
//! deadlines are layered on top of a [`FetchPackage`] by the wrappers below, so
//! the runner's contract stays "each item, once, terminal".

use crate::packages::fetch::{FetchPackage, PackageFuture};
use crate::runtime::telemetry::Telemetry;
use anyhow::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 30;

/// How many times a fetch is attempted and how long to wait in between.
///
/// `max_attempts` counts the first call, so `1` disables retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_delay: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
        }
    }

    /// Exponential backoff starting at one second, capped at thirty.
    pub fn exponential(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::none()
        }
    }

    pub fn with_delays(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 1
    }
}

#[derive(Clone, Copy)]
pub(crate) struct RetryBackoff<'a> {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<usize>,
    pub cancellation: Option<&'a CancellationToken>,
}

impl<'a> RetryBackoff<'a> {
    pub(crate) fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: None,
            cancellation: None,
        }
    }

    pub(crate) fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub(crate) fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

pub(crate) enum RetryDisposition {
    Retry,
    Abort,
}

/// Runs `operation` until it succeeds, the error is classified as fatal, attempts run out, or
/// the cancellation token fires during a backoff. The last error is returned untouched.
pub(crate) async fn retry_with_backoff<'a, T, F, Fut, L, C>(
    config: RetryBackoff<'a>,
    mut operation: F,
    mut on_retry: L,
    mut classify_error: C,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
    L: FnMut(usize, Duration, &Error, bool),
    C: FnMut(usize, &Error) -> RetryDisposition,
{
    let mut attempt = 0;
    let mut backoff = config.initial_delay;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => match classify_error(attempt, &err) {
                RetryDisposition::Abort => return Err(err),
                RetryDisposition::Retry => {
                    let exhausted = config
                        .max_attempts
                        .map(|max| attempt >= max)
                        .unwrap_or(false);
                    let cancelled = config
                        .cancellation
                        .map(CancellationToken::is_cancelled)
                        .unwrap_or(false);

                    on_retry(attempt, backoff, &err, !exhausted && !cancelled);

                    if exhausted || cancelled {
                        return Err(err);
                    }

                    if !sleep_with_cancellation(backoff, config.cancellation).await {
                        return Err(err);
                    }
                    backoff = next_backoff(backoff, config.max_delay);
                }
            },
        }
    }
}

/// Returns `false` when the sleep was cut short by cancellation.
async fn sleep_with_cancellation(
    delay: Duration,
    cancellation: Option<&CancellationToken>,
) -> bool {
    if delay.is_zero() {
        yield_now().await;
        return true;
    }

    if let Some(token) = cancellation {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = sleep(delay) => true,
        }
    } else {
        sleep(delay).await;
        true
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }

    let mut next = current.saturating_mul(2);
    if next > max_backoff {
        next = max_backoff;
    }
    next
}

/// Retries the wrapped fetcher according to a [`RetryPolicy`].
pub struct RetryingFetch<F> {
    inner: F,
    policy: RetryPolicy,
    telemetry: Arc<Telemetry>,
    cancellation: Option<CancellationToken>,
    retryable: fn(&Error) -> bool,
}

impl<F: FetchPackage> RetryingFetch<F> {
    pub fn new(inner: F, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            telemetry: Arc::new(Telemetry::default()),
            cancellation: None,
            retryable: |_| true,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Errors for which `retryable` returns `false` fail the item immediately.
    pub fn with_retryable(mut self, retryable: fn(&Error) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Stops scheduling further attempts once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

impl<F: FetchPackage> FetchPackage for RetryingFetch<F> {
    fn fetch<'a>(&'a self, item: &'a str) -> PackageFuture<'a> {
        Box::pin(async move {
            let mut backoff = RetryBackoff::new(self.policy.initial_delay, self.policy.max_delay)
                .with_max_attempts(self.policy.max_attempts.max(1));
            if let Some(token) = self.cancellation.as_ref() {
                backoff = backoff.with_cancellation(token);
            }

            retry_with_backoff(
                backoff,
                |_attempt| self.inner.fetch(item),
                |attempt, delay, err, will_retry| {
                    if will_retry {
                        self.telemetry.record_retry();
                        tracing::warn!(
                            item,
                            attempt,
                            backoff_ms = delay.as_millis().min(u128::from(u64::MAX)) as u64,
                            error = %err,
                            "package fetch failed; retrying"
                        );
                    } else if self.policy.is_enabled() {
                        tracing::error!(
                            item,
                            attempt,
                            error = %err,
                            "package fetch exhausted retries"
                        );
                    }
                },
                |_, err| {
                    if (self.retryable)(err) {
                        RetryDisposition::Retry
                    } else {
                        RetryDisposition::Abort
                    }
                },
            )
            .await
        })
    }
}

/// Error returned by [`TimeoutFetch`] when a fetch exceeds its deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemTimeout {
    pub item: String,
    pub after: Duration,
}

impl fmt::Display for ItemTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetching {} timed out after {:.1}s",
            self.item,
            self.after.as_secs_f64()
        )
    }
}

impl std::error::Error for ItemTimeout {}

/// Bounds every call to the wrapped fetcher by a fixed deadline. The timed-out future is
/// dropped, so the wrapped fetcher must tolerate cancellation at an await point.
pub struct TimeoutFetch<F> {
    inner: F,
    limit: Duration,
    telemetry: Arc<Telemetry>,
}

impl<F: FetchPackage> TimeoutFetch<F> {
    pub fn new(inner: F, limit: Duration) -> Self {
        Self {
            inner,
            limit,
            telemetry: Arc::new(Telemetry::default()),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }
}

impl<F: FetchPackage> FetchPackage for TimeoutFetch<F> {
    fn fetch<'a>(&'a self, item: &'a str) -> PackageFuture<'a> {
        Box::pin(async move {
            match timeout(self.limit, self.inner.fetch(item)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.telemetry.record_timeout();
                    Err(ItemTimeout {
                        item: item.to_owned(),
                        after: self.limit,
                    }
                    .into())
                }
            }
        })
    }
}
