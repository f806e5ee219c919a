use crate::error::{BrokerError, Result, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Suspends the caller between connection attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Bounded retry with a linearly growing delay.
///
/// After the n-th failed attempt the strategy waits `(n - 1) * base_delay`,
/// so the first retry is immediate. Once `max_attempts` attempts have failed
/// the last broker error is returned wrapped in [`TransportError::Connection`].
#[derive(Clone)]
pub struct RetryStrategy {
    max_attempts: u32,
    base_delay: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryStrategy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, BrokerError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut failures = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    failures += 1;
                    if failures >= max_attempts {
                        return Err(TransportError::Connection {
                            attempts: failures,
                            source: err,
                        });
                    }

                    let delay = self.calculate_delay(failures);
                    warn!(
                        attempt = failures,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Broker connection attempt failed, retrying"
                    );
                    if !delay.is_zero() {
                        self.sleeper.sleep(delay).await;
                    }
                }
            }
        }
    }

    fn calculate_delay(&self, failures: u32) -> Duration {
        self.base_delay * failures.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        fn total(&self) -> Duration {
            self.slept.lock().unwrap().iter().sum()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    fn strategy(sleeper: &Arc<RecordingSleeper>) -> RetryStrategy {
        RetryStrategy::new(15, Duration::from_millis(500)).with_sleeper(sleeper.clone())
    }

    #[test]
    fn test_delay_grows_linearly() {
        let strategy = RetryStrategy::new(15, Duration::from_millis(500));

        assert_eq!(strategy.calculate_delay(1), Duration::ZERO);
        assert_eq!(strategy.calculate_delay(2), Duration::from_millis(500));
        assert_eq!(strategy.calculate_delay(3), Duration::from_millis(1000));
        assert_eq!(strategy.calculate_delay(14), Duration::from_millis(6500));
    }

    #[tokio::test]
    async fn test_first_attempt_succeeds_without_sleeping() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let result = strategy(&sleeper)
            .execute(|| async { Ok::<_, BrokerError>(7) })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let calls = AtomicU32::new(0);

        let result = strategy(&sleeper)
            .execute(|| async {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 4 {
                    Err(BrokerError::ConnectionRefused("not yet".to_string()))
                } else {
                    Ok("connected")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "connected");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // 0 + 500 + 1000 + 1500
        assert_eq!(sleeper.total(), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let calls = AtomicU32::new(0);

        let result: Result<()> = strategy(&sleeper)
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::ConnectionRefused("down".to_string()))
            })
            .await;

        match result {
            Err(TransportError::Connection { attempts, source }) => {
                assert_eq!(attempts, 15);
                assert_eq!(source, BrokerError::ConnectionRefused("down".to_string()));
            }
            other => panic!("Expected connection error, got {:?}", other.err()),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 15);
        // Sleeps before retries 2..=15: 500ms * (0 + 1 + ... + 13)
        assert_eq!(sleeper.total(), Duration::from_millis(500 * 91));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let calls = AtomicU32::new(0);

        let result: Result<()> = RetryStrategy::new(0, Duration::from_millis(10))
            .with_sleeper(sleeper.clone())
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BrokerError::ChannelClosed)
            })
            .await;

        assert!(matches!(
            result,
            Err(TransportError::Connection { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
