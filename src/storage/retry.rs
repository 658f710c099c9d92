//! Bounded retry policy for store operations
//!
//! Every `MappingStore` operation runs through `RetryPolicy::run`, so lock
//! contention from other worker processes is absorbed in exactly one place.
//! Only contention errors (SQLITE_BUSY / SQLITE_LOCKED, pool checkout
//! timeouts) are retried; anything else is returned on the first attempt.

use super::StoreError;
use std::time::Duration;

/// Exponential backoff schedule applied uniformly by the mapping store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1)
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry
    pub base_delay: Duration,
    /// Upper bound for a single backoff delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    #[allow(dead_code)] // Used by tests and embedders that want fail-fast behavior
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Backoff before retry number `retry` (1-based): base * 2^(retry-1), capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Run `op`, retrying contention failures until the attempt budget is spent
    ///
    /// Blocks the calling thread while backing off; async callers go through
    /// `spawn_blocking`.
    pub fn run<T>(
        &self,
        name: &str,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_contention() => {
                    if attempt >= max_attempts {
                        tracing::warn!(
                            "Store operation '{}' still contended after {} attempt(s): {}",
                            name,
                            attempt,
                            e
                        );
                        return Err(StoreError::Busy { attempts: attempt });
                    }

                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        "Store operation '{}' contended, retrying in {:?} (attempt {}/{})",
                        name,
                        delay,
                        attempt,
                        max_attempts
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn busy_error() -> StoreError {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        ))
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_contention_is_retried_until_success() {
        let mut calls = 0;
        let result = fast_policy(3).run("test", || {
            calls += 1;
            if calls < 3 {
                Err(busy_error())
            } else {
                Ok(calls)
            }
        });

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_exhausted_budget_reports_busy() {
        let mut calls = 0;
        let result: Result<(), _> = fast_policy(2).run("test", || {
            calls += 1;
            Err(busy_error())
        });

        assert!(matches!(result, Err(StoreError::Busy { attempts: 2 })));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_non_contention_error_is_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = fast_policy(5).run("test", || {
            calls += 1;
            Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
        });

        assert!(matches!(result, Err(StoreError::Sqlite(_))));
        assert_eq!(calls, 1);
    }
}
