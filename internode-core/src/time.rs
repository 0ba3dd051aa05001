//! Time provider abstraction.
//!
//! All sleeps and timeouts in the messaging layer go through
//! [`TimeProvider`], never through `tokio::time` directly, so tests can
//! substitute compressed or scripted time.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during time operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    /// The operation timed out.
    #[error("operation timed out")]
    Elapsed,
}

/// Provider trait for time operations.
///
/// Single-core design - no Send bounds needed.
#[async_trait(?Send)]
pub trait TimeProvider: Clone {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration);

    /// Elapsed time since provider creation.
    ///
    /// A monotonic duration, suitable for scheduling comparisons.
    fn now(&self) -> Duration;

    /// Run a future with a timeout.
    ///
    /// Returns `Ok(result)` if the future completes within the timeout,
    /// or `Err(TimeError::Elapsed)` if it times out.
    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T>;
}

/// Real time provider using tokio's time facilities.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    start_time: std::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new tokio time provider.
    pub fn new() -> Self {
        Self {
            start_time: std::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }

    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T>,
    {
        match tokio::time::timeout(duration, future).await {
            Ok(result) => Ok(result),
            Err(_) => Err(TimeError::Elapsed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_elapsed() {
        let time = TokioTimeProvider::new();
        let result = time
            .timeout(Duration::from_millis(5), std::future::pending::<()>())
            .await;
        assert_eq!(result, Err(TimeError::Elapsed));
    }

    #[tokio::test]
    async fn test_timeout_completes() {
        let time = TokioTimeProvider::new();
        let result = time
            .timeout(Duration::from_millis(50), async { 42 })
            .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_now_is_monotonic() {
        let time = TokioTimeProvider::new();
        let before = time.now();
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(time.now() >= before);
    }
}
