//! Shared retry helper for transactions that can hit a serialization conflict.
//!
//! The wrapped closure must open, use and commit its own transaction, so every
//! attempt starts from a clean view of the store. Only
//! [`Error::SerializationConflict`](crate::errors::Error::SerializationConflict) is
//! retried; timeouts and business errors surface on the first attempt.

use crate::{
    config::RetryConfig,
    errors::{Error, Result},
};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Bounded attempts with a uniformly random sleep between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Lower bound of the sleep between attempts
    pub min_backoff: Duration,
    /// Upper bound of the sleep between attempts
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// A policy that never sleeps; useful in tests.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    fn backoff(&self) -> Duration {
        if self.max_backoff <= self.min_backoff {
            return self.min_backoff;
        }
        rand::thread_rng().gen_range(self.min_backoff..=self.max_backoff)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            min_backoff: config.min_backoff(),
            max_backoff: config.max_backoff(),
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-transient error, or the
/// attempts run out.
///
/// # Errors
/// Returns the operation's own error if it is not transient, or
/// `Error::ConcurrentUpdate` once `max_attempts` conflicts have occurred.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("{operation_name} succeeded on attempt {attempt}/{max_attempts}");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff();
                warn!(
                    "{operation_name} hit a write conflict on attempt {attempt}/{max_attempts}, retrying in {delay:?}: {e}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) if e.is_transient() => {
                warn!("{operation_name} gave up after {attempt} attempt(s): {e}");
                return Err(Error::ConcurrentUpdate { attempts: attempt });
            }
            Err(e) => return Err(e),
        }
    }
}
