//! Exponential backoff with jitter.
//!
//! [`retry_with_backoff`] and [`retry_with_predicate`] give up after
//! `max_retries`; the emitter uses them for derived-event publication. The
//! consumer only borrows the delay schedule, since an inbound message that
//! fails transiently must not be dropped.
//!
//! ```text
//! attempt 0 ── fail ── sleep(initial)          ── attempt 1
//! attempt 1 ── fail ── sleep(initial * m)      ── attempt 2
//! attempt n ── fail ── sleep(min(.., max))     ── ... until max_retries
//! ```
//!
//! # Example
//!
//! ```rust
//! use catalog_sync_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .multiplier(2.0)
//!     .build();
//!
//! let result = retry_with_backoff(policy, || async {
//!     Ok::<_, String>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `jitter`: true (each sleep is scaled by a random factor in `[0.5, 1.0]`)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first call
    pub max_retries: usize,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Spread sleeps so many workers failing together don't retry in lockstep
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
            jitter: true,
        }
    }

    /// Calculate the nominal delay for a given attempt number.
    ///
    /// `initial_delay * multiplier ^ attempt`, capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            self.max_delay
        } else {
            Duration::from_millis(delay_ms as u64)
        }
    }

    /// Delay actually slept before the next attempt, with jitter applied.
    #[must_use]
    pub fn sleep_for_attempt(&self, attempt: usize) -> Duration {
        let nominal = self.delay_for_attempt(attempt);
        if self.jitter {
            nominal.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            nominal
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<usize>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
    jitter: bool,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(3),
            initial_delay: self.initial_delay.unwrap_or(Duration::from_millis(100)),
            max_delay: self.max_delay.unwrap_or(Duration::from_secs(30)),
            multiplier: self.multiplier.unwrap_or(2.0),
            jitter: self.jitter,
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// Returns the first success, or the error of the final attempt once
/// `max_retries` retries have failed.
///
/// # Errors
///
/// The last error returned by `operation`.
///
/// # Example
///
/// ```rust
/// use catalog_sync_runtime::retry::{RetryPolicy, retry_with_backoff};
///
/// # async fn example() -> Result<(), String> {
/// let policy = RetryPolicy::default();
///
/// let result = retry_with_backoff(policy, || async {
///     Ok::<_, String>(42)
/// }).await?;
///
/// assert_eq!(result, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(policy: RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_predicate(policy, operation, |_| true).await
}

/// Retry an async operation while `is_retryable` accepts the error.
///
/// A non-retryable error is returned immediately.
///
/// # Errors
///
/// The first non-retryable error, or the last error once retries are
/// exhausted.
///
/// # Example
///
/// ```rust
/// use catalog_sync_runtime::retry::{RetryPolicy, retry_with_predicate};
///
/// # async fn example() -> Result<(), String> {
/// let policy = RetryPolicy::default();
///
/// let result = retry_with_predicate(
///     policy,
///     || async { Ok::<_, String>(42) },
///     |err: &String| err.contains("transient"),
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::warn!(error = %err, "Error is not retryable, failing immediately");
                    return Err(err);
                }

                if attempt >= policy.max_retries {
                    tracing::error!(attempt, error = %err, "Operation failed after max retries");
                    return Err(err);
                }

                let delay = policy.sleep_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, retrying"
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
