//! Automatic error recovery strategies.
//
// Spectrometer drivers occasionally drop an exposure (USB frame loss, read
// timeouts). Those come back as `AlignError::Transient` and are retried here
// with exponential backoff before the failure is allowed to surface.

use crate::config::RetrySettings;
use crate::error::AppResult;
use std::thread::sleep;
use std::time::Duration;
use tracing::warn;

/// Upper bound on a single retry delay, whatever the multiplier.
pub const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Factor applied to the delay after each retry.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(20),
            backoff_multiplier: 2.0,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            backoff_multiplier: settings.backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero-based), capped at [`MAX_BACKOFF`].
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(self.initial_backoff.as_secs_f64() * factor)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

/// Runs `operation`, retrying it while it fails with a transient error.
///
/// Non-transient errors are returned immediately. After `max_retries` retries
/// the last transient error is returned unchanged.
pub fn retry_transient<T, F>(policy: &RetryPolicy, what: &str, mut operation: F) -> AppResult<T>
where
    F: FnMut() -> AppResult<T>,
{
    let mut retry = 0;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && retry < policy.max_retries => {
                let delay = policy.backoff(retry);
                warn!(
                    operation = what,
                    attempt = retry + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, retrying"
                );
                sleep(delay);
                retry += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AlignError;
    use std::cell::Cell;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_retry_logic_succeeds() {
        let attempts = Cell::new(0);
        let result = retry_transient(&fast_policy(), "read", || {
            attempts.set(attempts.get() + 1);
            if attempts.get() >= 3 {
                Ok(42)
            } else {
                Err(AlignError::Transient("usb frame lost".to_string()))
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_retry_logic_fails() {
        let attempts = Cell::new(0);
        let result: AppResult<()> = retry_transient(&fast_policy(), "read", || {
            attempts.set(attempts.get() + 1);
            Err(AlignError::Transient("usb frame lost".to_string()))
        });
        assert!(matches!(result, Err(AlignError::Transient(_))));
        // first attempt plus three retries
        assert_eq!(attempts.get(), 4);
    }

    #[test]
    fn test_non_transient_is_not_retried() {
        let attempts = Cell::new(0);
        let result: AppResult<()> = retry_transient(&fast_policy(), "read", || {
            attempts.set(attempts.get() + 1);
            Err(AlignError::DriverFault("detector disconnected".to_string()))
        });
        assert!(matches!(result, Err(AlignError::DriverFault(_))));
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_backoff_is_exponential() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(1), Duration::from_millis(20));
        assert_eq!(policy.backoff(2), Duration::from_millis(40));
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            backoff_multiplier: 1e300,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), MAX_BACKOFF);

        policy.backoff_multiplier = f64::INFINITY;
        assert_eq!(policy.backoff(1), MAX_BACKOFF);
        assert_eq!(policy.backoff(u32::MAX), MAX_BACKOFF);

        policy.backoff_multiplier = f64::NAN;
        assert!(policy.backoff(1) <= MAX_BACKOFF);
    }
}
