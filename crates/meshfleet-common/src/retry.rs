//! Retry with Fibonacci backoff and jitter.
//!
//! Federation event handlers and connector startup wrap their Object Store
//! and repo calls in [`retry_with_fibonacci`]. Delays grow as
//! `step * fib(n)` (1, 1, 2, 3, 5, 8, ...) up to `max_delay`, each scaled by
//! a random 0.5x to 1.5x jitter so that connectors restarted together do not
//! retry in lockstep.
//!
//! # Example
//!
//! ```ignore
//! use meshfleet_common::retry::{retry_with_fibonacci, RetryConfig};
//!
//! let import = retry_with_fibonacci(
//!     &RetryConfig::default(),
//!     "upsert_service_import",
//!     || async { fleet.upsert_service_import(&export).await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Unit delay multiplied by the Fibonacci sequence
    pub step: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            step: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config that retries forever
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Un-jittered delay before the given retry (1-based)
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = fibonacci(retry);
        let secs = self.step.as_secs_f64() * factor as f64;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// n-th Fibonacci number with fib(1) = fib(2) = 1, saturating
fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Execute an async operation with Fibonacci backoff, retrying every error.
pub async fn retry_with_fibonacci<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_fibonacci_if(config, operation_name, |_| true, operation).await
}

/// Execute an async operation with Fibonacci backoff while `should_retry`
/// accepts the error.
///
/// Returns the first error `should_retry` rejects, or the last error once
/// `max_attempts` is exhausted.
pub async fn retry_with_fibonacci_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let delay =
                    Duration::from_secs_f64(config.base_delay(attempt).as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
