//! # Outcome Reconciler
//!
//! Watches accepted transactions until they are final, then settles the queue
//! entry, the registration outcome and the wallet lease. This is the only
//! place that writes outcome records or releases wallets.

use crate::chain::{AcceptanceReceipt, ChainClient, ConfirmationStatus};
use crate::config::ChainTimingConfig;
use crate::error::{ChainError, CoreError, FailureCode, PoolError, StoreError};
use crate::metrics::SequencerMetrics;
use crate::model::{EntryId, EntryStatus, OutcomeStatus, QueueEntry, RegistrationOutcome, WalletState};
use crate::pool::WalletPool;
use crate::queue::{CancelOutcome, TransactionQueue};
use crate::store::Store;
use crate::utils::logger::{ALERT_TARGET, OUTCOME_TARGET};
use crate::utils::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How a dispatched entry was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Confirmed {
        entry_id: EntryId,
        nonce: u64,
        tx_hash: String,
    },
    /// Back in the queue for another attempt
    Requeued { entry_id: EntryId, nonce: u64 },
    Failed { entry_id: EntryId, code: FailureCode },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub released: usize,
    /// Expired leases left alone because their wallet still has work
    pub blocked: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
}

pub struct Reconciler {
    pool: Arc<WalletPool>,
    queue: Arc<TransactionQueue>,
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn Store>,
    policy: RetryPolicy,
    timing: ChainTimingConfig,
    metrics: Arc<SequencerMetrics>,
    outcomes: RwLock<HashMap<String, RegistrationOutcome>>,
    resolved: Notify,
}

impl Reconciler {
    pub fn new(
        pool: Arc<WalletPool>,
        queue: Arc<TransactionQueue>,
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn Store>,
        policy: RetryPolicy,
        timing: ChainTimingConfig,
        metrics: Arc<SequencerMetrics>,
    ) -> Self {
        Self {
            pool,
            queue,
            chain,
            store,
            policy,
            timing,
            metrics,
            outcomes: RwLock::new(HashMap::new()),
            resolved: Notify::new(),
        }
    }

    // ---- outcome records ----

    /// Records a pending outcome for a registration that just leased `wallet_address`.
    pub async fn open_outcome(
        &self,
        owner_request_id: &str,
        wallet_address: &str,
    ) -> Result<RegistrationOutcome, StoreError> {
        let mut outcomes = self.outcomes.write().await;
        if let Some(existing) = outcomes.get(owner_request_id) {
            return Ok(existing.clone());
        }
        let outcome = RegistrationOutcome::pending(owner_request_id, wallet_address);
        self.store.save_outcome(&outcome).await?;
        outcomes.insert(owner_request_id.to_string(), outcome.clone());
        Ok(outcome)
    }

    pub async fn bind_entry(&self, owner_request_id: &str, entry_id: &str) -> Result<(), StoreError> {
        let mut outcomes = self.outcomes.write().await;
        let Some(current) = outcomes.get(owner_request_id) else {
            return Ok(());
        };
        let mut updated = current.clone();
        updated.entry_id = Some(entry_id.to_string());
        updated.updated_at = Utc::now();
        self.store.save_outcome(&updated).await?;
        outcomes.insert(owner_request_id.to_string(), updated);
        Ok(())
    }

    pub async fn outcome(&self, owner_request_id: &str) -> Option<RegistrationOutcome> {
        self.outcomes.read().await.get(owner_request_id).cloned()
    }

    pub async fn outcome_counts(&self) -> OutcomeCounts {
        let outcomes = self.outcomes.read().await;
        let mut counts = OutcomeCounts::default();
        for outcome in outcomes.values() {
            match outcome.status {
                OutcomeStatus::Pending => counts.pending += 1,
                OutcomeStatus::Completed => counts.completed += 1,
                OutcomeStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Waits until the outcome is terminal or `timeout` elapses, returning
    /// the latest record. `None` for an unknown request.
    pub async fn await_outcome(
        &self,
        owner_request_id: &str,
        timeout: Duration,
    ) -> Option<RegistrationOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.resolved.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let current = self.outcome(owner_request_id).await?;
            if current.status.is_terminal() || Instant::now() >= deadline {
                return Some(current);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.outcome(owner_request_id).await;
            }
        }
    }

    /// First terminal write wins; later ones return the stored record unchanged.
    async fn finish_outcome(
        &self,
        owner_request_id: &str,
        status: OutcomeStatus,
        tx_hash: Option<&str>,
        failure: Option<FailureCode>,
    ) -> Result<Option<RegistrationOutcome>, StoreError> {
        let mut outcomes = self.outcomes.write().await;
        let Some(current) = outcomes.get(owner_request_id) else {
            warn!(request_id = %owner_request_id, "No outcome record to settle");
            return Ok(None);
        };
        if current.status.is_terminal() {
            return Ok(Some(current.clone()));
        }

        let mut updated = current.clone();
        updated.status = status;
        updated.transaction_hash = tx_hash.map(str::to_string);
        updated.failure = failure;
        updated.updated_at = Utc::now();

        self.store.save_outcome(&updated).await?;
        outcomes.insert(owner_request_id.to_string(), updated.clone());
        drop(outcomes);

        self.resolved.notify_waiters();
        Ok(Some(updated))
    }

    /// Gives up on a registration that never got its entry queued.
    pub async fn abort(&self, owner_request_id: &str, wallet_address: &str) {
        match self
            .finish_outcome(
                owner_request_id,
                OutcomeStatus::Failed,
                None,
                Some(FailureCode::Internal),
            )
            .await
        {
            Ok(Some(_)) => self.metrics.record_failure(),
            Ok(None) => {}
            Err(e) => {
                error!(request_id = %owner_request_id, error = %e, "Failed to record aborted registration");
            }
        }
        if let Err(e) = self.release_if_drained(wallet_address, owner_request_id).await {
            warn!(wallet = %wallet_address, error = %e, "Could not release wallet after abort");
        }
    }

    // ---- wallet release ----

    /// Releases the wallet once every one of its entries is terminal.
    ///
    /// The lease must belong to `owner_request_id` or to a registration whose
    /// outcome is already terminal.
    pub async fn release_if_drained(
        &self,
        wallet_address: &str,
        owner_request_id: &str,
    ) -> Result<bool, PoolError> {
        if !self.queue.is_drained(wallet_address).await {
            debug!(wallet = %wallet_address, "Wallet still has unresolved entries");
            return Ok(false);
        }
        let Some(lease) = self.pool.lease_of(wallet_address).await else {
            return Ok(false);
        };
        let owner_settled = lease.owner_request_id == owner_request_id
            || self
                .outcome(&lease.owner_request_id)
                .await
                .is_some_and(|o| o.status.is_terminal());
        if !owner_settled {
            return Ok(false);
        }
        self.pool
            .release_held(wallet_address, &lease.owner_request_id)
            .await
    }

    /// Releases expired leases whose wallets are drained. A still-pending
    /// outcome on such a lease fails with `LeaseExpired`.
    pub async fn sweep_expired_leases(&self, now: DateTime<Utc>) -> Result<SweepReport, CoreError> {
        let mut report = SweepReport::default();
        for lease in self.pool.expired_leases(now).await {
            if !self.queue.is_drained(&lease.address).await {
                warn!(
                    wallet = %lease.address,
                    request_id = %lease.owner_request_id,
                    expired_at = %lease.expires_at,
                    "Lease expired with unresolved entries"
                );
                report.blocked += 1;
                continue;
            }

            let settled = self
                .finish_outcome(
                    &lease.owner_request_id,
                    OutcomeStatus::Failed,
                    None,
                    Some(FailureCode::LeaseExpired),
                )
                .await?;
            if settled.is_some_and(|o| o.failure == Some(FailureCode::LeaseExpired)) {
                self.metrics.record_failure();
                info!(
                    target: OUTCOME_TARGET,
                    request_id = %lease.owner_request_id,
                    wallet = %lease.address,
                    code = FailureCode::LeaseExpired.as_str(),
                    "Registration FAILED"
                );
            }
            if self
                .pool
                .release_held(&lease.address, &lease.owner_request_id)
                .await?
            {
                report.released += 1;
            }
        }
        if report.released > 0 || report.blocked > 0 {
            info!(
                released = report.released,
                blocked = report.blocked,
                "Swept expired leases"
            );
        }
        Ok(report)
    }

    // ---- chain outcomes ----

    async fn current(&self, entry: &QueueEntry) -> QueueEntry {
        self.queue
            .get(&entry.id)
            .await
            .unwrap_or_else(|| entry.clone())
    }

    /// Polls the chain until the transaction is final, dropped, or the
    /// confirmation budget runs out, then settles the entry.
    pub async fn watch(
        &self,
        entry: &QueueEntry,
        receipt: &AcceptanceReceipt,
    ) -> Result<Resolution, CoreError> {
        let deadline = Instant::now() + self.timing.confirmation_timeout();
        let mut polls = 0u32;

        while polls < self.timing.max_polls {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            polls += 1;

            let status =
                match tokio::time::timeout(remaining, self.chain.watch_confirmation(receipt)).await {
                    Err(_) => break,
                    Ok(Err(e)) => {
                        debug!(entry_id = %entry.id, poll = polls, error = %e, "Confirmation poll failed");
                        None
                    }
                    Ok(Ok(status)) => Some(status),
                };

            match status {
                Some(ConfirmationStatus::Confirmed { depth }) => {
                    return self.confirm(entry, receipt, depth).await;
                }
                Some(ConfirmationStatus::Pending { depth }) if depth >= self.timing.required_depth => {
                    return self.confirm(entry, receipt, depth).await;
                }
                Some(status @ (ConfirmationStatus::Reorged | ConfirmationStatus::Dropped)) => {
                    return self.final_rejection(entry, receipt, status).await;
                }
                _ => {}
            }

            let pause = self
                .timing
                .poll_interval()
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(pause).await;
        }

        self.confirmation_timed_out(entry, polls).await
    }

    async fn confirm(
        &self,
        entry: &QueueEntry,
        receipt: &AcceptanceReceipt,
        depth: u32,
    ) -> Result<Resolution, CoreError> {
        let confirmed = match self.queue.mark_confirmed(&entry.id, &receipt.tx_hash).await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                let e = CoreError::from(e);
                if e.is_fatal() {
                    error!(
                        target: ALERT_TARGET,
                        wallet = %entry.wallet_address,
                        entry_id = %entry.id,
                        nonce = entry.nonce,
                        error = %e,
                        "Confirmation out of nonce order"
                    );
                }
                return Err(e);
            }
        };

        self.finish_outcome(
            &confirmed.owner_request_id,
            OutcomeStatus::Completed,
            Some(&receipt.tx_hash),
            None,
        )
        .await?;

        let latency = (Utc::now() - confirmed.created_at)
            .to_std()
            .unwrap_or_default();
        self.metrics.record_confirmation(latency);
        info!(
            target: OUTCOME_TARGET,
            request_id = %confirmed.owner_request_id,
            wallet = %confirmed.wallet_address,
            nonce = confirmed.nonce,
            depth,
            tx_hash = %receipt.tx_hash,
            "Registration CONFIRMED"
        );

        self.release_if_drained(&confirmed.wallet_address, &confirmed.owner_request_id)
            .await?;
        Ok(Resolution::Confirmed {
            entry_id: confirmed.id,
            nonce: confirmed.nonce,
            tx_hash: receipt.tx_hash.clone(),
        })
    }

    /// Reorged or dropped: retry under a new nonce while attempts remain,
    /// unless an earlier send for the same nonce made it in.
    async fn final_rejection(
        &self,
        entry: &QueueEntry,
        receipt: &AcceptanceReceipt,
        status: ConfirmationStatus,
    ) -> Result<Resolution, CoreError> {
        let reason = match status {
            ConfirmationStatus::Reorged => "reorged out after mining",
            _ => "dropped without being mined",
        };
        let current = self.current(entry).await;
        warn!(
            wallet = %current.wallet_address,
            entry_id = %current.id,
            nonce = current.nonce,
            attempt = current.attempts,
            "Transaction {}", reason
        );

        if current.abandoned {
            return self
                .fail(&current, FailureCode::Cancelled, reason, false)
                .await;
        }
        if self.policy.attempts_exhausted(current.attempts) {
            return self
                .fail(&current, FailureCode::AttemptsExhausted, reason, false)
                .await;
        }
        if let Some(resolution) = self.settle_prior(&current, Some(&receipt.tx_hash)).await? {
            return Ok(resolution);
        }

        self.renonce(&current, reason).await
    }

    async fn renonce(&self, entry: &QueueEntry, reason: &str) -> Result<Resolution, CoreError> {
        self.queue.note_error(&entry.id, reason).await?;
        let requeued = self
            .queue
            .requeue_with_new_nonce(&entry.id, self.policy.backoff(entry.attempts))
            .await?;
        self.metrics.record_renonce();
        Ok(Resolution::Requeued {
            entry_id: requeued.id,
            nonce: requeued.nonce,
        })
    }

    /// Polls every hash the chain accepted for the entry's nonce once and
    /// confirms the entry with the first that is final.
    async fn settle_prior(
        &self,
        entry: &QueueEntry,
        except: Option<&str>,
    ) -> Result<Option<Resolution>, CoreError> {
        let current = self.current(entry).await;
        if current.status != EntryStatus::Submitted {
            return Ok(None);
        }

        for tx_hash in &current.accepted_hashes {
            if except == Some(tx_hash.as_str()) {
                continue;
            }
            let receipt = AcceptanceReceipt {
                tx_hash: tx_hash.clone(),
                wallet_address: current.wallet_address.clone(),
                nonce: current.nonce,
                accepted_at: current.updated_at,
            };
            let polled = tokio::time::timeout(
                self.timing.confirmation_timeout(),
                self.chain.watch_confirmation(&receipt),
            )
            .await;
            match polled {
                Ok(Ok(ConfirmationStatus::Confirmed { depth })) => {
                    info!(entry_id = %current.id, tx_hash = %tx_hash, "Earlier transaction was mined");
                    return self.confirm(&current, &receipt, depth).await.map(Some);
                }
                Ok(Ok(ConfirmationStatus::Pending { depth }))
                    if depth >= self.timing.required_depth =>
                {
                    return self.confirm(&current, &receipt, depth).await.map(Some);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    debug!(entry_id = %current.id, tx_hash = %tx_hash, error = %e, "Could not poll earlier transaction");
                }
                Err(_) => {
                    debug!(entry_id = %current.id, tx_hash = %tx_hash, "Poll of earlier transaction timed out");
                }
            }
        }
        Ok(None)
    }

    /// The chain refused the entry's nonce as already used. Either one of the
    /// entry's own earlier sends was mined, or another transaction took the
    /// slot and the entry moves to a fresh nonce.
    pub async fn resync_consumed_nonce(
        &self,
        entry: &QueueEntry,
        reason: &str,
    ) -> Result<Resolution, CoreError> {
        let current = self.current(entry).await;
        let wallet = current.wallet_address.as_str();

        // The refusal alone puts the chain past this nonce
        let mut tx_count = current.nonce + 1;
        match self.chain.account_nonce(wallet).await {
            Ok(count) => tx_count = tx_count.max(count),
            Err(e) => {
                warn!(wallet = %wallet, error = %e, "Could not read chain nonce after refusal")
            }
        }
        self.queue.sequencer().reconcile(wallet, tx_count).await?;

        if let Some(resolution) = self.settle_prior(&current, None).await? {
            return Ok(resolution);
        }
        warn!(
            wallet = %wallet,
            entry_id = %current.id,
            nonce = current.nonce,
            tx_count,
            "Nonce taken by another transaction"
        );

        if current.abandoned {
            return self
                .fail_unmined(&current, FailureCode::Cancelled, reason, false)
                .await;
        }
        if self.policy.attempts_exhausted(current.attempts) {
            return self
                .fail_unmined(&current, FailureCode::AttemptsExhausted, reason, false)
                .await;
        }
        self.renonce(&current, reason).await
    }

    /// No verdict within the confirmation budget: same nonce, retry path.
    async fn confirmation_timed_out(
        &self,
        entry: &QueueEntry,
        polls: u32,
    ) -> Result<Resolution, CoreError> {
        self.metrics.record_timeout();
        let current = self.current(entry).await;
        let reason = ChainError::ConfirmationTimeout {
            timeout_ms: self.timing.confirmation_timeout_ms,
        }
        .to_string();
        warn!(
            wallet = %current.wallet_address,
            entry_id = %current.id,
            nonce = current.nonce,
            polls,
            "Confirmation timed out"
        );

        if current.abandoned {
            return self
                .fail(&current, FailureCode::Cancelled, &reason, false)
                .await;
        }
        if self.policy.attempts_exhausted(current.attempts) {
            return self
                .fail(&current, FailureCode::AttemptsExhausted, &reason, false)
                .await;
        }

        self.queue.note_error(&current.id, &reason).await?;
        let requeued = self
            .queue
            .requeue_for_retry(&current.id, None, self.policy.backoff(current.attempts))
            .await?;
        self.metrics.record_retry();
        Ok(Resolution::Requeued {
            entry_id: requeued.id,
            nonce: requeued.nonce,
        })
    }

    /// Terminal failure of an entry and its registration, unless one of its
    /// earlier sends turns out to be mined.
    ///
    /// The wallet is retired when `retire_wallet` is set, otherwise released
    /// once drained.
    pub async fn fail(
        &self,
        entry: &QueueEntry,
        code: FailureCode,
        reason: &str,
        retire_wallet: bool,
    ) -> Result<Resolution, CoreError> {
        if let Some(resolution) = self.settle_prior(entry, None).await? {
            return Ok(resolution);
        }
        self.fail_unmined(entry, code, reason, retire_wallet).await
    }

    async fn fail_unmined(
        &self,
        entry: &QueueEntry,
        code: FailureCode,
        reason: &str,
        retire_wallet: bool,
    ) -> Result<Resolution, CoreError> {
        self.queue.mark_failed(&entry.id, reason).await?;

        if retire_wallet {
            match self.pool.retire(&entry.wallet_address, reason).await {
                Ok(()) => self.metrics.record_retirement(),
                Err(PoolError::InvalidState { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.finish_outcome(&entry.owner_request_id, OutcomeStatus::Failed, None, Some(code))
            .await?;
        self.metrics.record_failure();
        info!(
            target: OUTCOME_TARGET,
            request_id = %entry.owner_request_id,
            wallet = %entry.wallet_address,
            nonce = entry.nonce,
            code = code.as_str(),
            reason = %reason,
            "Registration FAILED"
        );

        if !retire_wallet {
            self.release_if_drained(&entry.wallet_address, &entry.owner_request_id)
                .await?;
        }
        Ok(Resolution::Failed {
            entry_id: entry.id.clone(),
            code,
        })
    }

    /// Cancels a pending registration. Queued entries fail at once; a
    /// submitted entry is abandoned and settles on its next verdict.
    pub async fn cancel(&self, owner_request_id: &str) -> Result<Option<CancelOutcome>, CoreError> {
        let Some(outcome) = self.outcome(owner_request_id).await else {
            return Ok(None);
        };
        if outcome.status.is_terminal() {
            return Ok(None);
        }
        let Some(entry_id) = outcome.entry_id else {
            return Ok(None);
        };

        let result = self.queue.cancel(&entry_id).await?;
        if result == CancelOutcome::Cancelled {
            self.finish_outcome(
                owner_request_id,
                OutcomeStatus::Failed,
                None,
                Some(FailureCode::Cancelled),
            )
            .await?;
            self.metrics.record_failure();
            info!(
                target: OUTCOME_TARGET,
                request_id = %owner_request_id,
                wallet = %outcome.wallet_address,
                code = FailureCode::Cancelled.as_str(),
                "Registration FAILED"
            );
            self.release_if_drained(&outcome.wallet_address, owner_request_id)
                .await?;
        } else {
            info!(request_id = %owner_request_id, entry_id = %entry_id, "Submitted entry abandoned");
        }
        Ok(Some(result))
    }

    // ---- restart ----

    pub(crate) async fn restore(&self, records: Vec<RegistrationOutcome>) {
        let mut outcomes = self.outcomes.write().await;
        for record in records {
            outcomes.insert(record.owner_request_id.clone(), record);
        }
        info!("Restored {} registration outcomes", outcomes.len());
    }

    /// Settles pending outcomes whose entries resolved, or vanished, while
    /// the process was down.
    pub(crate) async fn resume_pending(&self) -> Result<usize, CoreError> {
        let pending: Vec<RegistrationOutcome> = self
            .outcomes
            .read()
            .await
            .values()
            .filter(|o| o.status == OutcomeStatus::Pending)
            .cloned()
            .collect();

        let mut settled = 0;
        for outcome in pending {
            let entry = match &outcome.entry_id {
                Some(id) => self.queue.get(id).await,
                None => None,
            };
            let (status, tx_hash, failure) = match &entry {
                Some(e) if e.status == EntryStatus::Confirmed => {
                    (OutcomeStatus::Completed, e.tx_hash.clone(), None)
                }
                Some(e) if e.status == EntryStatus::Failed => {
                    (OutcomeStatus::Failed, None, Some(self.failure_code_for(e).await))
                }
                Some(_) => continue,
                None => (OutcomeStatus::Failed, None, Some(FailureCode::Internal)),
            };

            self.finish_outcome(
                &outcome.owner_request_id,
                status,
                tx_hash.as_deref(),
                failure,
            )
            .await?;
            self.release_if_drained(&outcome.wallet_address, &outcome.owner_request_id)
                .await?;
            settled += 1;
        }
        if settled > 0 {
            info!("Settled {} outcomes left pending at shutdown", settled);
        }
        Ok(settled)
    }

    async fn failure_code_for(&self, entry: &QueueEntry) -> FailureCode {
        if entry.last_error.as_deref() == Some("cancelled") || entry.abandoned {
            return FailureCode::Cancelled;
        }
        if self.pool.state_of(&entry.wallet_address).await == Some(WalletState::Retired) {
            return FailureCode::WalletRetired;
        }
        FailureCode::AttemptsExhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{SimulatedChain, WatchBehavior};
    use crate::model::{SigningKeyRef, TxPayload};
    use crate::sequencer::NonceSequencer;
    use crate::store::MemoryStore;
    use crate::utils::retry::RetryConfig;

    struct Fixture {
        chain: Arc<SimulatedChain>,
        pool: Arc<WalletPool>,
        queue: Arc<TransactionQueue>,
        reconciler: Reconciler,
    }

    async fn fixture(max_attempts: u32) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(SimulatedChain::new());
        let pool = Arc::new(WalletPool::new(store.clone(), Duration::from_secs(60)));
        pool.provision("0xaaa", SigningKeyRef::new("k")).await.unwrap();
        let sequencer = Arc::new(NonceSequencer::new(store.clone()));
        sequencer.reconcile("0xaaa", 0).await.unwrap();
        let queue = Arc::new(TransactionQueue::new(sequencer, store.clone()));
        let timing = ChainTimingConfig {
            confirmation_timeout_ms: 200,
            poll_interval_ms: 5,
            max_polls: 10,
            ..ChainTimingConfig::default()
        };
        let reconciler = Reconciler::new(
            pool.clone(),
            queue.clone(),
            chain.clone(),
            store,
            RetryPolicy::new(RetryConfig::new(max_attempts, 1).without_jitter()),
            timing,
            Arc::new(SequencerMetrics::default()),
        );
        Fixture {
            chain,
            pool,
            queue,
            reconciler,
        }
    }

    async fn submitted(f: &Fixture, request: &str) -> (QueueEntry, AcceptanceReceipt) {
        f.pool.acquire(request).await.unwrap();
        f.reconciler.open_outcome(request, "0xaaa").await.unwrap();
        let entry = f
            .queue
            .enqueue(request, "0xaaa", TxPayload::registration(serde_json::json!({})))
            .await
            .unwrap();
        f.reconciler.bind_entry(request, &entry.id).await.unwrap();
        let entry = f.queue.dequeue_next("0xaaa").await.unwrap().unwrap();
        let receipt = f
            .chain
            .submit("0xaaa", &SigningKeyRef::new("k"), entry.nonce, &entry.payload)
            .await
            .unwrap();
        (entry, receipt)
    }

    #[tokio::test]
    async fn test_confirmation_completes_and_releases() {
        let f = fixture(3).await;
        let (entry, receipt) = submitted(&f, "req-1").await;

        let resolution = f.reconciler.watch(&entry, &receipt).await.unwrap();
        assert!(matches!(resolution, Resolution::Confirmed { nonce: 0, .. }));

        let outcome = f.reconciler.outcome("req-1").await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Completed);
        assert_eq!(outcome.transaction_hash, Some(receipt.tx_hash));
        assert_eq!(f.pool.state_of("0xaaa").await, Some(WalletState::Free));
    }

    #[tokio::test]
    async fn test_drop_requeues_under_recycled_nonce() {
        let f = fixture(3).await;
        f.chain.script_watch("0xaaa", [WatchBehavior::Drop]);
        let (entry, receipt) = submitted(&f, "req-1").await;

        let resolution = f.reconciler.watch(&entry, &receipt).await.unwrap();
        assert_eq!(
            resolution,
            Resolution::Requeued {
                entry_id: entry.id.clone(),
                nonce: 0
            }
        );
        assert_eq!(f.pool.state_of("0xaaa").await, Some(WalletState::Leased));
        assert_eq!(
            f.reconciler.outcome("req-1").await.unwrap().status,
            OutcomeStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_timeout_after_last_attempt_fails_and_frees_wallet() {
        let f = fixture(1).await;
        f.chain
            .script_watch("0xaaa", std::iter::repeat(WatchBehavior::Pending).take(20));
        let (entry, receipt) = submitted(&f, "req-1").await;

        let resolution = f.reconciler.watch(&entry, &receipt).await.unwrap();
        assert!(matches!(
            resolution,
            Resolution::Failed {
                code: FailureCode::AttemptsExhausted,
                ..
            }
        ));
        let outcome = f.reconciler.outcome("req-1").await.unwrap();
        assert_eq!(outcome.failure, Some(FailureCode::AttemptsExhausted));
        assert_eq!(f.pool.state_of("0xaaa").await, Some(WalletState::Free));
    }

    #[tokio::test]
    async fn test_cancel_queued_registration() {
        let f = fixture(3).await;
        f.pool.acquire("req-1").await.unwrap();
        f.reconciler.open_outcome("req-1", "0xaaa").await.unwrap();
        let entry = f
            .queue
            .enqueue("req-1", "0xaaa", TxPayload::registration(serde_json::json!({})))
            .await
            .unwrap();
        f.reconciler.bind_entry("req-1", &entry.id).await.unwrap();

        assert_eq!(
            f.reconciler.cancel("req-1").await.unwrap(),
            Some(CancelOutcome::Cancelled)
        );
        let outcome = f
            .reconciler
            .await_outcome("req-1", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(outcome.failure, Some(FailureCode::Cancelled));
        assert_eq!(f.pool.state_of("0xaaa").await, Some(WalletState::Free));
        assert_eq!(f.reconciler.cancel("req-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_needs_owner_or_settled_owner() {
        let f = fixture(3).await;
        f.pool.acquire("req-1").await.unwrap();
        f.reconciler.open_outcome("req-1", "0xaaa").await.unwrap();

        assert!(!f.reconciler.release_if_drained("0xaaa", "req-2").await.unwrap());
        assert_eq!(f.pool.state_of("0xaaa").await, Some(WalletState::Leased));

        f.reconciler
            .finish_outcome("req-1", OutcomeStatus::Failed, None, Some(FailureCode::Internal))
            .await
            .unwrap();
        assert!(f.reconciler.release_if_drained("0xaaa", "req-2").await.unwrap());
        assert_eq!(f.pool.state_of("0xaaa").await, Some(WalletState::Free));
    }

    #[tokio::test]
    async fn test_sweep_releases_only_drained_wallets() {
        let f = fixture(3).await;
        let (entry, _receipt) = submitted(&f, "req-1").await;

        let later = Utc::now() + chrono::Duration::seconds(120);
        let report = f.reconciler.sweep_expired_leases(later).await.unwrap();
        assert_eq!(report, SweepReport { released: 0, blocked: 1 });

        f.queue.mark_failed(&entry.id, "test").await.unwrap();
        let report = f.reconciler.sweep_expired_leases(later).await.unwrap();
        assert_eq!(report.released, 1);
        assert_eq!(
            f.reconciler.outcome("req-1").await.unwrap().failure,
            Some(FailureCode::LeaseExpired)
        );
    }

    #[tokio::test]
    async fn test_await_outcome_wakes_on_settlement() {
        let f = Arc::new(fixture(3).await);
        let (entry, receipt) = submitted(&f, "req-1").await;

        let waiter = {
            let f = f.clone();
            tokio::spawn(async move {
                f.reconciler
                    .await_outcome("req-1", Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.reconciler.watch(&entry, &receipt).await.unwrap();

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Completed);
        assert!(f
            .reconciler
            .await_outcome("unknown", Duration::from_millis(1))
            .await
            .is_none());
    }
}
