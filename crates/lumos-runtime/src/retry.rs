//! [`RetryPolicy`] – bounded retry of transient hardware failures.
//!
//! An operation is attempted up to `max_attempts` times.  Only errors whose
//! [`HardwareErrorKind`][lumos_types::HardwareErrorKind] is retryable are
//! retried; anything else ends the sequence on the spot.  Between attempts the
//! policy sleeps for a fixed backoff.  The sleep is a plain `await` point, so
//! a supervising task that aborts the retrying task preempts it immediately.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use lumos_runtime::retry::{RetryError, RetryPolicy};
//! use lumos_types::HardwareError;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let policy = RetryPolicy::new(3, Duration::from_millis(1));
//! let result: Result<(), RetryError> = policy
//!     .run("stage.move", |_| async { Err(HardwareError::transient("bus busy")) })
//!     .await;
//! assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use lumos_types::HardwareError;
use thiserror::Error;
use tracing::warn;

/// Why a retried operation finally failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryError {
    /// Every attempt failed with a retryable error.
    #[error("{attempts} attempts failed, last error: {last}")]
    Exhausted { attempts: u32, last: HardwareError },
    /// A non-retryable error ended the sequence.
    #[error(transparent)]
    Fatal(HardwareError),
}

impl RetryError {
    /// The hardware error that ended the sequence.
    pub fn last_error(&self) -> &HardwareError {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal(e) => e,
        }
    }
}

/// Fixed-backoff retry policy.  `max_attempts` counts total attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
}

impl RetryPolicy {
    /// `max_attempts` below 1 is treated as 1.
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Run `op` until it succeeds, fails fatally, or runs out of attempts.
    ///
    /// `op` receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// [`RetryError::Exhausted`] after `max_attempts` retryable failures,
    /// [`RetryError::Fatal`] on the first non-retryable failure.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, HardwareError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.kind.is_retryable() => return Err(RetryError::Fatal(e)),
                Err(e) if attempt >= self.max_attempts => {
                    warn!(action = label, attempt, error = %e, "retries exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    warn!(
                        action = label,
                        attempt,
                        max = self.max_attempts,
                        error = %e,
                        "transient hardware error, retrying"
                    );
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
