use std::future::Future;
use std::time::Duration;

use metrics::counter;
use serde_derive::Deserialize;
use tracing::debug;
use tracing::warn;

use crate::ContractError;

/// Gas and retry configuration shared by every chain interaction.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct GasPolicy {
    /// Starting gas price in wei. Zero asks the node for its suggestion.
    pub base_gas_price: u128,
    /// Added to the gas price each time a stuck transaction is replaced.
    pub price_increment: u128,
    pub gas_limit: u64,
    /// Resubmissions of one transaction before giving up.
    pub max_submit_retries: u32,
    /// Receipt polls before giving up on a submitted transaction.
    pub max_confirm_retries: u32,
    /// Full submit-and-confirm cycles after a mined-but-failed receipt.
    pub max_tx_fail_retries: u32,
    /// Attempts of a read-only call on transient errors.
    pub max_read_retries: u32,
    /// Reads waiting for a directory publish to become visible.
    pub publish_confirm_retries: u32,
    pub retry_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub read_retry_delay_ms: u64,
}

impl Default for GasPolicy {
    fn default() -> Self {
        Self {
            base_gas_price: 1_000_000_000,
            price_increment: 500_000_000,
            gas_limit: 8_000_000,
            max_submit_retries: 5,
            max_confirm_retries: 30,
            max_tx_fail_retries: 3,
            max_read_retries: 10,
            publish_confirm_retries: 20,
            retry_delay_ms: 2_000,
            poll_interval_ms: 3_000,
            read_retry_delay_ms: 1_000,
        }
    }
}

impl GasPolicy {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Policy for read-only calls hitting a flaky or lagging node.
    pub fn read_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_read_retries,
            Duration::from_millis(self.read_retry_delay_ms),
        )
    }

    /// Policy for waiting until a directory write is visible to reads.
    pub fn publish_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.publish_confirm_retries,
            Duration::from_millis(self.read_retry_delay_ms),
        )
    }
}

/// A bounded, fixed-backoff retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least one.
    pub fn new(
        max_attempts: u32,
        delay: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `f` until it succeeds, fails with a non-transient error, or the
    /// attempts run out.
    pub async fn retry<T, F, Fut>(
        &self,
        operation: &'static str,
        mut f: F,
    ) -> Result<T, ContractError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ContractError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    counter!("mefs_read_retries_total", "operation" => operation).increment(1);
                    if attempt >= self.max_attempts {
                        return Err(ContractError::RetriesExhausted {
                            operation,
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }
                    warn!(
                        "{} failed, retrying. attempt: {}/{} error: {}",
                        operation, attempt, self.max_attempts, err
                    );
                },
                Err(err) => return Err(err),
            }
            tokio::time::sleep(self.delay).await;
        }
    }

    /// Run `f` until it yields `Some`. Transient errors count as a miss.
    pub async fn poll<T, F, Fut>(
        &self,
        operation: &'static str,
        mut f: F,
    ) -> Result<T, ContractError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, ContractError>>,
    {
        let mut last = String::from("not visible yet");
        for attempt in 1..=self.max_attempts {
            match f().await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {
                    debug!(
                        "{} not ready. attempt: {}/{}",
                        operation, attempt, self.max_attempts
                    );
                },
                Err(err) if err.is_transient() => {
                    warn!(
                        "{} poll failed. attempt: {}/{} error: {}",
                        operation, attempt, self.max_attempts, err
                    );
                    last = err.to_string();
                },
                Err(err) => return Err(err),
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.delay).await;
            }
        }
        Err(ContractError::RetriesExhausted {
            operation,
            attempts: self.max_attempts,
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::chain::ChainError;

    fn transient() -> ContractError {
        ContractError::Chain(ChainError::Transport("unreachable".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_secs(1));

        let value = policy
            .retry("read", move || {
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok(7)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_is_bounded() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new(4, Duration::from_secs(1));

        let result: Result<(), _> = policy
            .retry("read", move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        assert!(matches!(
            result,
            Err(ContractError::RetriesExhausted { attempts: 4, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_does_not_retry_permanent_errors() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new(4, Duration::from_secs(1));

        let result: Result<(), _> = policy
            .retry("read", move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ContractError::Cancelled) }
            })
            .await;

        assert!(matches!(result, Err(ContractError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_waits_for_value() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_secs(1));

        let value = policy
            .poll("publish", move || {
                async move {
                    match calls.fetch_add(1, Ordering::SeqCst) {
                        0 => Ok(None),
                        1 => Err(transient()),
                        _ => Ok(Some("visible")),
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "visible");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_is_bounded() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let result: Result<(), _> = policy.poll("publish", || async { Ok(None) }).await;

        assert!(matches!(
            result,
            Err(ContractError::RetriesExhausted { attempts: 3, .. })
        ));
    }
}
