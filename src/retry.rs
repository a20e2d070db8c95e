use crate::constants::{BASE_BACKOFF, MAX_BACKOFF, MAX_STREAM_ATTEMPTS};
use crate::types::{ObservedError, Result};
use std::future::Future;
use std::time::Duration;

/// Bounded retry around a single streaming attempt.
///
/// Backoff is exponential from `base_delay`, capped at `max_delay`, with ±25%
/// jitter. Only transport-class failures are retried; everything else, and the
/// last transport failure, propagates to the caller.
#[derive(Debug, Clone)]
pub struct ConnectionRetrier {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ConnectionRetrier {
    fn default() -> Self {
        Self::new(MAX_STREAM_ATTEMPTS, BASE_BACKOFF)
    }
}

impl ConnectionRetrier {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: MAX_BACKOFF,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Runs `operation(attempt)` until it succeeds or the attempt bound is hit.
    ///
    /// `on_reconnecting(n)` fires before attempt `n > 1`; `on_reconnected()`
    /// fires once if a retry succeeds.
    pub async fn execute_with_retry<F, Fut, T, R, C>(
        &self,
        mut operation: F,
        mut on_reconnecting: R,
        mut on_reconnected: C,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        R: FnMut(u32),
        C: FnMut(),
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!("[📡 -> ⚙️ ] Reconnected on attempt {}", attempt);
                        on_reconnected();
                    }
                    return Ok(value);
                }
                Err(e) if attempt < self.max_attempts && Self::is_retryable(&e) => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        "[📡 -> ⚙️ ] Stream attempt {} failed: {}. Retrying in {:?} (jittered)...",
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    on_reconnecting(attempt + 1);
                }
                Err(e) => {
                    if Self::is_retryable(&e) {
                        tracing::error!(
                            "[📡 -> ⚙️ ] Giving up after {} attempts: {}",
                            attempt,
                            e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Delay before the retry that follows failed attempt `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base_ms = self.base_delay.as_millis() as u64;
        let capped = base_ms
            .saturating_mul(2u64.pow(exponent))
            .min(self.max_delay.as_millis() as u64);
        let jitter_range = capped / 4;
        let jitter = if jitter_range > 0 {
            fastrand::i64(-(jitter_range as i64)..jitter_range as i64)
        } else {
            0
        };
        Duration::from_millis((capped as i64 + jitter).max(1) as u64)
    }

    fn is_retryable(err: &ObservedError) -> bool {
        err.inner.is_transport()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let retrier = ConnectionRetrier::new(5, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(300));
        let first = retrier.backoff(1).as_millis();
        assert!((75..=125).contains(&first), "first backoff {}", first);
        let second = retrier.backoff(2).as_millis();
        assert!((150..=250).contains(&second), "second backoff {}", second);
        let capped = retrier.backoff(8).as_millis();
        assert!((225..=375).contains(&capped), "capped backoff {}", capped);
    }
}
