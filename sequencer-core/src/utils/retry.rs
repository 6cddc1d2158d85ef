use crate::error::{ChainError, RejectionKind};
use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Submission attempts per entry before it fails permanently
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter: bool,
    /// Fee raise applied to the replacement payload after an underpriced rejection
    pub fee_bump_bps: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            exponential_base: 2.0,
            jitter: true,
            fee_bump_bps: 1_250,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms: base_delay_ms * 30,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Backoff before retry number `attempt` (0-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.base_delay_ms as f64 * self.exponential_base.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64);

        let delay_ms = if self.jitter {
            let rng_factor = rand::thread_rng().gen_range(0.5..=1.5);
            delay_ms * rng_factor
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms as u64)
    }
}

/// How a chain failure should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Network or pricing trouble; retry under the attempt cap
    Transient,
    /// The wallet itself is unusable; give up and retire it
    WalletSpecific,
    /// The nonce is already spent on chain, possibly by our own earlier send
    NonceConsumed,
}

pub fn classify(error: &ChainError) -> FaultClass {
    match error {
        ChainError::SubmissionRejected { kind, .. } if kind.is_wallet_specific() => {
            FaultClass::WalletSpecific
        }
        ChainError::SubmissionRejected {
            kind: RejectionKind::NonceTooLow,
            ..
        } => FaultClass::NonceConsumed,
        _ => FaultClass::Transient,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration, bump_fee: bool },
    GiveUp { retire_wallet: bool },
    /// Re-read the chain before deciding anything
    Resync,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn attempts_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.config.max_attempts
    }

    /// Decide what to do after attempt number `attempts` (1-based) failed.
    pub fn decide(&self, attempts: u32, error: &ChainError) -> RetryDecision {
        match classify(error) {
            FaultClass::WalletSpecific => {
                return RetryDecision::GiveUp {
                    retire_wallet: true,
                }
            }
            FaultClass::NonceConsumed => return RetryDecision::Resync,
            FaultClass::Transient => {}
        }
        if self.attempts_exhausted(attempts) {
            return RetryDecision::GiveUp {
                retire_wallet: false,
            };
        }
        let bump_fee = matches!(
            error,
            ChainError::SubmissionRejected {
                kind: RejectionKind::Underpriced,
                ..
            }
        );
        RetryDecision::Retry {
            delay: self.config.calculate_delay(attempts.saturating_sub(1)),
            bump_fee,
        }
    }

    pub fn backoff(&self, attempts: u32) -> Duration {
        self.config.calculate_delay(attempts.saturating_sub(1))
    }
}

/// Retries a read-only chain call with backoff; `max_attempts` bounds total calls.
pub async fn with_retry<T, E, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) if attempt >= max_attempts => {
                debug!(
                    "{} failed after {} attempts. Last error: {}",
                    operation_name, attempt, e
                );
                return Err(e);
            }
            Err(e) => {
                let delay = config.calculate_delay(attempt - 1);
                debug!(
                    "{} failed (attempt {}/{}). Retrying in {:?}: {}",
                    operation_name, attempt, max_attempts, delay, e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rejected(kind: RejectionKind) -> ChainError {
        ChainError::SubmissionRejected {
            kind,
            reason: "test".to_string(),
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let config = RetryConfig::new(5, 100).with_max_delay(350).without_jitter();
        assert_eq!(config.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(350));
        assert_eq!(config.calculate_delay(8), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::new(5, 100);
        for _ in 0..50 {
            let d = config.calculate_delay(1).as_millis();
            assert!((100..=300).contains(&d), "delay {} out of band", d);
        }
    }

    #[test]
    fn test_underpriced_retries_with_fee_bump() {
        let policy = RetryPolicy::new(RetryConfig::new(3, 10).without_jitter());
        match policy.decide(1, &rejected(RejectionKind::Underpriced)) {
            RetryDecision::Retry { bump_fee, .. } => assert!(bump_fee),
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_timeout_retries_without_bump() {
        let policy = RetryPolicy::new(RetryConfig::new(3, 10).without_jitter());
        let decision = policy.decide(2, &ChainError::AcceptanceTimeout { timeout_ms: 5 });
        assert_eq!(
            decision,
            RetryDecision::Retry {
                delay: Duration::from_millis(20),
                bump_fee: false
            }
        );
    }

    #[test]
    fn test_gives_up_at_ceiling() {
        let policy = RetryPolicy::new(RetryConfig::new(3, 10));
        assert_eq!(
            policy.decide(3, &rejected(RejectionKind::Malformed)),
            RetryDecision::GiveUp {
                retire_wallet: false
            }
        );
    }

    #[test]
    fn test_wallet_specific_retires_immediately() {
        let policy = RetryPolicy::new(RetryConfig::new(10, 10));
        assert_eq!(
            policy.decide(1, &rejected(RejectionKind::InsufficientFunds)),
            RetryDecision::GiveUp {
                retire_wallet: true
            }
        );
        assert_eq!(
            classify(&ChainError::Transport {
                reason: "connection reset".into()
            }),
            FaultClass::Transient
        );
    }

    #[test]
    fn test_nonce_too_low_resyncs_even_at_ceiling() {
        let policy = RetryPolicy::new(RetryConfig::new(2, 100).without_jitter());
        let error = rejected(RejectionKind::NonceTooLow);
        assert_eq!(classify(&error), FaultClass::NonceConsumed);
        assert_eq!(policy.decide(1, &error), RetryDecision::Resync);
        assert_eq!(policy.decide(2, &error), RetryDecision::Resync);
    }

    #[tokio::test]
    async fn test_with_retry_success_after_failures() {
        let counter = AtomicUsize::new(0);
        let counter = &counter;
        let config = RetryConfig::new(3, 1).without_jitter();

        let result: Result<u64, String> = with_retry(&config, "account_nonce", move || async move {
            let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if count < 3 {
                Err("temporary error".to_string())
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_all_failures() {
        let counter = AtomicUsize::new(0);
        let counter = &counter;
        let config = RetryConfig::new(2, 1).without_jitter();

        let result: Result<u64, String> = with_retry(&config, "account_nonce", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("permanent error".to_string())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
