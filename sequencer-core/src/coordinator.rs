//! # Registration Coordinator
//!
//! Entry point for the registration service. Wires the pool, sequencer,
//! queue, submitter and reconciler over one store and one chain client, and
//! turns a registration request into a leased wallet plus a queued entry.

use crate::chain::ChainClient;
use crate::config::SequencerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{CoreError, FailureCode, PoolError, RegistrationError};
use crate::metrics::{MetricsSnapshot, SequencerMetrics};
use crate::model::{OutcomeStatus, QueueEntry, RegistrationOutcome, TxPayload, WalletState};
use crate::pool::{PoolStats, WalletLease, WalletPool};
use crate::queue::{CancelOutcome, QueueStatus, TransactionQueue};
use crate::reconciler::{OutcomeCounts, Reconciler};
use crate::sequencer::NonceSequencer;
use crate::store::{PurgeReport, Store};
use crate::submitter::Submitter;
use crate::utils::inventory::load_inventory;
use crate::utils::lanes::LaneMap;
use crate::utils::retry::{with_retry, RetryPolicy};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Successful registration as seen by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationReceipt {
    pub wallet_address: String,
    pub transaction_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SequencerStatus {
    pub pool: PoolStats,
    pub queue: QueueStatus,
    pub outcomes: OutcomeCounts,
    pub active_leases: Vec<WalletLease>,
    pub metrics: MetricsSnapshot,
}

pub struct RegistrationCoordinator {
    config: SequencerConfig,
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainClient>,
    pool: Arc<WalletPool>,
    queue: Arc<TransactionQueue>,
    reconciler: Arc<Reconciler>,
    submitter: Arc<Submitter>,
    metrics: Arc<SequencerMetrics>,
    requests: LaneMap<()>,
}

fn outcome_result(outcome: &RegistrationOutcome) -> Result<RegistrationReceipt, RegistrationError> {
    match (outcome.status, &outcome.transaction_hash) {
        (OutcomeStatus::Completed, Some(hash)) => Ok(RegistrationReceipt {
            wallet_address: outcome.wallet_address.clone(),
            transaction_hash: hash.clone(),
        }),
        (OutcomeStatus::Pending, _) => Err(RegistrationError::Pending {
            owner_request_id: outcome.owner_request_id.clone(),
            wallet_address: outcome.wallet_address.clone(),
        }),
        (OutcomeStatus::Failed, _) | (OutcomeStatus::Completed, None) => {
            Err(RegistrationError::Failure {
                owner_request_id: outcome.owner_request_id.clone(),
                code: outcome.failure.unwrap_or(FailureCode::Internal),
            })
        }
    }
}

impl RegistrationCoordinator {
    /// Builds the components without touching the store.
    pub fn new(config: SequencerConfig, store: Arc<dyn Store>, chain: Arc<dyn ChainClient>) -> Self {
        let metrics = Arc::new(SequencerMetrics::default());
        let policy = RetryPolicy::new(config.retry.clone());

        let pool = Arc::new(WalletPool::new(store.clone(), config.pool.lease_ttl()));
        let sequencer = Arc::new(NonceSequencer::new(store.clone()));
        let queue = Arc::new(TransactionQueue::new(sequencer, store.clone()));
        let reconciler = Arc::new(Reconciler::new(
            pool.clone(),
            queue.clone(),
            chain.clone(),
            store.clone(),
            policy.clone(),
            config.chain.clone(),
            metrics.clone(),
        ));
        let submitter = Arc::new(Submitter::new(
            pool.clone(),
            queue.clone(),
            chain.clone(),
            reconciler.clone(),
            policy,
            config.chain.submission_timeout(),
            metrics.clone(),
        ));

        Self {
            config,
            store,
            chain,
            pool,
            queue,
            reconciler,
            submitter,
            metrics,
            requests: LaneMap::new(),
        }
    }

    /// Builds the components and restores their state from the store.
    pub async fn open(
        config: SequencerConfig,
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainClient>,
    ) -> Result<Self> {
        let coordinator = Self::new(config, store, chain);
        coordinator.bootstrap().await?;
        Ok(coordinator)
    }

    async fn bootstrap(&self) -> Result<()> {
        let records = self
            .store
            .load_wallets()
            .await
            .context("Failed to load wallets")?;
        self.pool.restore(&records).await;

        let nonces: HashMap<String, Option<u64>> = records
            .iter()
            .map(|r| (r.wallet.address.clone(), r.last_known_nonce))
            .collect();
        let entries = self
            .store
            .load_entries()
            .await
            .context("Failed to load queue entries")?;
        self.queue
            .load(entries, &nonces)
            .await
            .context("Failed to rebuild queue")?;
        self.resync_in_flight().await;

        let outcomes = self
            .store
            .load_outcomes()
            .await
            .context("Failed to load registration outcomes")?;
        self.reconciler.restore(outcomes).await;

        if self.pool.stats().await.total == 0 {
            if let Some(path) = self.config.pool.inventory_path.clone() {
                self.provision_from_inventory(&path).await?;
            }
        }

        self.reconciler
            .resume_pending()
            .await
            .context("Failed to settle outcomes left pending")?;
        Ok(())
    }

    /// Aligns wallets that still have unresolved entries with the chain, which
    /// may have mined some of them while the process was down.
    async fn resync_in_flight(&self) {
        for wallet in self.queue.busy_wallets().await {
            let counted = with_retry(&self.config.retry, "account_nonce", || {
                self.chain.account_nonce(&wallet)
            })
            .await;
            let tx_count = match counted {
                Ok(count) => count,
                Err(e) => {
                    warn!(wallet = %wallet, error = %e, "Chain nonce unavailable; resync deferred to first send");
                    continue;
                }
            };
            match self.queue.sequencer().reconcile(&wallet, tx_count).await {
                Ok(last_known) => {
                    debug!(wallet = %wallet, tx_count, last_known = ?last_known, "Resynced in-flight wallet")
                }
                Err(e) => warn!(wallet = %wallet, error = %e, "Could not resync in-flight wallet"),
            }
        }
    }

    /// Adds every wallet in the inventory file that the pool does not know yet.
    pub async fn provision_from_inventory(&self, path: &str) -> Result<usize> {
        let inventory = load_inventory(path)?;
        let mut added = 0;
        for entry in &inventory {
            match self
                .pool
                .provision(&entry.address, entry.signing_key_ref())
                .await
            {
                Ok(()) => added += 1,
                Err(PoolError::DuplicateWallet { .. }) => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to provision {}", entry.address))
                }
            }
        }
        info!("Provisioned {} of {} inventory wallets", added, inventory.len());
        Ok(added)
    }

    /// Leases a wallet and queues the registration transaction.
    ///
    /// Idempotent on `owner_request_id`: a known request returns its recorded
    /// outcome. A new request returns `Pending` once its entry is queued.
    pub async fn request_registration(
        &self,
        owner_request_id: &str,
        payload: TxPayload,
    ) -> Result<RegistrationReceipt, RegistrationError> {
        self.metrics.record_request();
        let lane = self
            .requests
            .get_or_insert_with(owner_request_id, || ())
            .await;
        let result = {
            let _serialized = lane.lock().await;
            self.register(owner_request_id, payload).await
        };
        drop(lane);
        self.requests.remove_idle(owner_request_id).await;
        result
    }

    async fn register(
        &self,
        owner_request_id: &str,
        payload: TxPayload,
    ) -> Result<RegistrationReceipt, RegistrationError> {
        if let Some(outcome) = self.reconciler.outcome(owner_request_id).await {
            debug!(request_id = %owner_request_id, status = outcome.status.as_str(), "Known registration");
            return outcome_result(&outcome);
        }

        let busy = self.free_but_busy().await;
        let lease = match self
            .pool
            .acquire_with_wait(owner_request_id, &busy, self.config.pool.acquire_wait())
            .await
        {
            Ok(lease) => lease,
            Err(PoolError::PoolExhausted { total, leased, .. }) => {
                self.metrics.record_pool_exhausted();
                warn!(request_id = %owner_request_id, total, leased, "Wallet pool exhausted");
                return Err(RegistrationError::PoolExhausted { total, leased });
            }
            Err(e) => {
                error!(request_id = %owner_request_id, error = %e, "Wallet acquisition failed");
                return Err(RegistrationError::Failure {
                    owner_request_id: owner_request_id.to_string(),
                    code: FailureCode::Internal,
                });
            }
        };

        match self.admit(owner_request_id, &lease.address, payload).await {
            Ok(entry) => {
                info!(
                    request_id = %owner_request_id,
                    wallet = %lease.address,
                    entry_id = %entry.id,
                    nonce = entry.nonce,
                    "Registration queued"
                );
                Err(RegistrationError::Pending {
                    owner_request_id: owner_request_id.to_string(),
                    wallet_address: lease.address,
                })
            }
            Err(e) => {
                error!(
                    request_id = %owner_request_id,
                    wallet = %lease.address,
                    error = %e,
                    "Could not queue registration"
                );
                self.reconciler.abort(owner_request_id, &lease.address).await;
                Err(RegistrationError::Failure {
                    owner_request_id: owner_request_id.to_string(),
                    code: FailureCode::Internal,
                })
            }
        }
    }

    /// Free wallets that still hold unresolved entries. Leased wallets are
    /// skipped by the pool on their own.
    async fn free_but_busy(&self) -> HashSet<String> {
        let mut excluded = HashSet::new();
        for wallet in self.queue.busy_wallets().await {
            if self.pool.state_of(&wallet).await == Some(WalletState::Free) {
                excluded.insert(wallet);
            }
        }
        excluded
    }

    async fn admit(
        &self,
        owner_request_id: &str,
        wallet_address: &str,
        payload: TxPayload,
    ) -> Result<QueueEntry, CoreError> {
        // Recorded first so a retried request sees the same verdict
        self.reconciler
            .open_outcome(owner_request_id, wallet_address)
            .await?;

        let tx_count = with_retry(&self.config.retry, "account_nonce", || {
            self.chain.account_nonce(wallet_address)
        })
        .await?;
        self.queue
            .sequencer()
            .reconcile(wallet_address, tx_count)
            .await?;

        let entry = self
            .queue
            .enqueue(owner_request_id, wallet_address, payload)
            .await?;
        self.reconciler
            .bind_entry(owner_request_id, &entry.id)
            .await?;
        Ok(entry)
    }

    /// Waits up to `timeout` for the registration to settle.
    pub async fn await_registration(
        &self,
        owner_request_id: &str,
        timeout: Duration,
    ) -> Result<RegistrationReceipt, RegistrationError> {
        match self
            .reconciler
            .await_outcome(owner_request_id, timeout)
            .await
        {
            Some(outcome) => outcome_result(&outcome),
            None => Err(RegistrationError::UnknownRequest {
                owner_request_id: owner_request_id.to_string(),
            }),
        }
    }

    pub async fn cancel(&self, owner_request_id: &str) -> Result<Option<CancelOutcome>, CoreError> {
        let lane = self
            .requests
            .get_or_insert_with(owner_request_id, || ())
            .await;
        let result = {
            let _serialized = lane.lock().await;
            self.reconciler.cancel(owner_request_id).await
        };
        drop(lane);
        self.requests.remove_idle(owner_request_id).await;
        result
    }

    /// A dispatcher driving this coordinator's wallets.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.submitter.clone(),
            self.queue.clone(),
            self.reconciler.clone(),
            self.config.worker.clone(),
            self.config.maintenance.clone(),
        )
    }

    pub async fn status(&self) -> SequencerStatus {
        SequencerStatus {
            pool: self.pool.stats().await,
            queue: self.queue.status().await,
            outcomes: self.reconciler.outcome_counts().await,
            active_leases: self.pool.active_leases().await,
            metrics: self.metrics.snapshot(),
        }
    }

    /// Maintenance reset: drops pool and queue rows, then reinitializes from
    /// the wallet inventory. Run with the dispatcher stopped.
    pub async fn purge(&self) -> Result<PurgeReport> {
        let report = self
            .store
            .purge_pool_and_queue()
            .await
            .context("Maintenance purge failed")?;
        self.pool.clear().await;
        self.queue.clear().await;
        warn!(
            wallets = report.wallets,
            entries = report.entries,
            "Pool and queue purged"
        );
        self.bootstrap().await?;
        Ok(report)
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<WalletPool> {
        &self.pool
    }

    pub fn queue(&self) -> &Arc<TransactionQueue> {
        &self.queue
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn submitter(&self) -> &Arc<Submitter> {
        &self.submitter
    }

    pub fn metrics(&self) -> &Arc<SequencerMetrics> {
        &self.metrics
    }
}
