//! # Transaction Submitter
//!
//! One step of a wallet's pipeline: take the lowest-nonce entry, send it to
//! the chain and either hand the receipt to the [`Reconciler`] or route the
//! rejection through the retry policy.

use crate::chain::ChainClient;
use crate::error::{ChainError, CoreError, FailureCode};
use crate::metrics::SequencerMetrics;
use crate::model::QueueEntry;
use crate::pool::WalletPool;
use crate::queue::TransactionQueue;
use crate::reconciler::{Reconciler, Resolution};
use crate::utils::retry::{RetryDecision, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing dispatchable for the wallet
    Idle,
    Resolved(Resolution),
}

pub struct Submitter {
    pool: Arc<WalletPool>,
    queue: Arc<TransactionQueue>,
    chain: Arc<dyn ChainClient>,
    reconciler: Arc<Reconciler>,
    policy: RetryPolicy,
    submission_timeout: Duration,
    metrics: Arc<SequencerMetrics>,
}

impl Submitter {
    pub fn new(
        pool: Arc<WalletPool>,
        queue: Arc<TransactionQueue>,
        chain: Arc<dyn ChainClient>,
        reconciler: Arc<Reconciler>,
        policy: RetryPolicy,
        submission_timeout: Duration,
        metrics: Arc<SequencerMetrics>,
    ) -> Self {
        Self {
            pool,
            queue,
            chain,
            reconciler,
            policy,
            submission_timeout,
            metrics,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs one entry of `wallet_address` to its next resting state.
    pub async fn step(&self, wallet_address: &str) -> Result<StepOutcome, CoreError> {
        let Some(entry) = self.queue.dequeue_next(wallet_address).await? else {
            return Ok(StepOutcome::Idle);
        };

        let span = info_span!(
            "submit",
            wallet = %wallet_address,
            entry_id = %entry.id,
            nonce = entry.nonce
        );
        self.submit_entry(entry)
            .instrument(span)
            .await
            .map(StepOutcome::Resolved)
    }

    async fn submit_entry(&self, entry: QueueEntry) -> Result<Resolution, CoreError> {
        if self
            .queue
            .sequencer()
            .consumed_on_chain(&entry.wallet_address, entry.nonce)
            .await
        {
            debug!("Nonce already spent on chain, checking earlier sends");
            return self
                .reconciler
                .resync_consumed_nonce(&entry, "nonce already spent on chain")
                .await;
        }

        let signing_key = match self.pool.signing_key(&entry.wallet_address).await {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "Wallet unusable before submission");
                return self
                    .reconciler
                    .fail(&entry, FailureCode::WalletRetired, &e.to_string(), false)
                    .await;
            }
        };

        self.metrics.record_submission();
        debug!(attempt = entry.attempts, "Submitting transaction");
        let submitted = tokio::time::timeout(
            self.submission_timeout,
            self.chain.submit(
                &entry.wallet_address,
                &signing_key,
                entry.nonce,
                &entry.payload,
            ),
        )
        .await;
        drop(signing_key);

        let result = match submitted {
            Ok(result) => result,
            Err(_) => {
                self.metrics.record_timeout();
                Err(ChainError::AcceptanceTimeout {
                    timeout_ms: self.submission_timeout.as_millis() as u64,
                })
            }
        };

        match result {
            Ok(receipt) => {
                info!(tx_hash = %receipt.tx_hash, "Transaction accepted");
                if let Err(e) = self.queue.record_acceptance(&entry.id, &receipt.tx_hash).await {
                    warn!(tx_hash = %receipt.tx_hash, error = %e, "Could not record accepted hash");
                }
                self.reconciler.watch(&entry, &receipt).await
            }
            Err(e) => self.handle_rejection(entry, e).await,
        }
    }

    async fn handle_rejection(
        &self,
        entry: QueueEntry,
        error: ChainError,
    ) -> Result<Resolution, CoreError> {
        if matches!(error, ChainError::SubmissionRejected { .. }) {
            self.metrics.record_rejection();
        }
        let reason = error.to_string();
        warn!(attempt = entry.attempts, error = %reason, "Submission failed");

        let current = self.queue.get(&entry.id).await.unwrap_or(entry);
        match self.policy.decide(current.attempts, &error) {
            RetryDecision::Resync => {
                self.reconciler
                    .resync_consumed_nonce(&current, &reason)
                    .await
            }
            _ if current.abandoned => {
                self.reconciler
                    .fail(&current, FailureCode::Cancelled, &reason, false)
                    .await
            }
            RetryDecision::Retry { delay, bump_fee } => {
                self.queue.note_error(&current.id, &reason).await?;
                let payload = bump_fee
                    .then(|| current.payload.with_fee_bump(self.policy.config().fee_bump_bps));
                let requeued = self
                    .queue
                    .requeue_for_retry(&current.id, payload, delay)
                    .await?;
                self.metrics.record_retry();
                debug!(
                    delay_ms = delay.as_millis() as u64,
                    fee_bps = requeued.payload.fee_multiplier_bps,
                    "Retry scheduled"
                );
                Ok(Resolution::Requeued {
                    entry_id: requeued.id,
                    nonce: requeued.nonce,
                })
            }
            RetryDecision::GiveUp { retire_wallet } => {
                let code = if retire_wallet {
                    FailureCode::WalletRetired
                } else {
                    FailureCode::AttemptsExhausted
                };
                self.reconciler
                    .fail(&current, code, &reason, retire_wallet)
                    .await
            }
        }
    }
}
