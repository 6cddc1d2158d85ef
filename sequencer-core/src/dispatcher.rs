//! # Dispatcher
//!
//! Scans the queue for wallets with dispatchable work and runs one
//! [`Submitter::step`] per wallet at a time, up to a concurrency limit.
//! Lease expiry sweeps and terminal entry cleanup run on the same loop.

use crate::config::{MaintenanceConfig, WorkerConfig};
use crate::error::CoreError;
use crate::queue::TransactionQueue;
use crate::reconciler::{Reconciler, Resolution};
use crate::submitter::{StepOutcome, Submitter};
use crate::utils::logger::ALERT_TARGET;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub steps: u64,
    pub confirmed: u64,
    pub requeued: u64,
    pub failed: u64,
    pub errors: u64,
    /// Wallets stopped after an invariant violation
    pub halted: Vec<String>,
}

type StepResult = (String, Result<StepOutcome, CoreError>);

pub struct Dispatcher {
    submitter: Arc<Submitter>,
    queue: Arc<TransactionQueue>,
    reconciler: Arc<Reconciler>,
    worker: WorkerConfig,
    maintenance: MaintenanceConfig,
    halted: Mutex<HashSet<String>>,
    /// Wallets whose in-flight entry could not be put back after a failed step
    stranded: Mutex<HashSet<String>>,
}

impl Dispatcher {
    pub fn new(
        submitter: Arc<Submitter>,
        queue: Arc<TransactionQueue>,
        reconciler: Arc<Reconciler>,
        worker: WorkerConfig,
        maintenance: MaintenanceConfig,
    ) -> Self {
        Self {
            submitter,
            queue,
            reconciler,
            worker,
            maintenance,
            halted: Mutex::new(HashSet::new()),
            stranded: Mutex::new(HashSet::new()),
        }
    }

    /// Runs until `token` is cancelled, then waits for in-flight steps.
    pub async fn run(&self, token: CancellationToken) -> DispatchReport {
        self.run_loop(token, false).await
    }

    /// Runs until every wallet that is not halted has no unresolved entries,
    /// or `limit` elapses.
    pub async fn run_until_idle(&self, limit: Duration) -> DispatchReport {
        let token = CancellationToken::new();
        let timer = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                token.cancel();
            })
        };
        let report = self.run_loop(token, true).await;
        timer.abort();
        report
    }

    pub async fn halted_wallets(&self) -> Vec<String> {
        let mut halted: Vec<String> = self.halted.lock().await.iter().cloned().collect();
        halted.sort();
        halted
    }

    async fn run_loop(&self, token: CancellationToken, stop_when_idle: bool) -> DispatchReport {
        let semaphore = Arc::new(Semaphore::new(self.worker.max_concurrent_wallets.max(1)));
        let mut set: JoinSet<StepResult> = JoinSet::new();
        let mut active: HashSet<String> = HashSet::new();
        let mut report = DispatchReport::default();
        let mut last_maintenance = Instant::now();

        info!(
            max_concurrent = self.worker.max_concurrent_wallets,
            scan_interval_ms = self.worker.scan_interval_ms,
            "Dispatcher started"
        );

        loop {
            if token.is_cancelled() {
                break;
            }
            if stop_when_idle && set.is_empty() && self.is_idle().await {
                break;
            }
            if last_maintenance.elapsed() >= self.maintenance.sweep_interval() {
                self.maintain().await;
                last_maintenance = Instant::now();
            }

            self.retry_stranded(&active).await;

            let halted = self.halted.lock().await.clone();
            for wallet in self.queue.dispatchable_wallets().await {
                if active.contains(&wallet) || halted.contains(&wallet) {
                    continue;
                }
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                active.insert(wallet.clone());

                let submitter = self.submitter.clone();
                let span = info_span!("wallet", wallet = %wallet);
                set.spawn(
                    async move {
                        let _permit = permit;
                        let result = submitter.step(&wallet).await;
                        (wallet, result)
                    }
                    .instrument(span),
                );
            }

            tokio::select! {
                _ = token.cancelled() => {}
                Some(joined) = set.join_next() => {
                    self.absorb(joined, &mut active, &mut report).await;
                }
                _ = tokio::time::sleep(self.worker.scan_interval()) => {}
            }
        }

        // Let in-flight steps reach a resting state
        while let Some(joined) = set.join_next().await {
            self.absorb(joined, &mut active, &mut report).await;
        }
        report.halted = self.halted_wallets().await;

        info!(
            steps = report.steps,
            confirmed = report.confirmed,
            requeued = report.requeued,
            failed = report.failed,
            errors = report.errors,
            "Dispatcher stopped"
        );
        report
    }

    async fn is_idle(&self) -> bool {
        let halted = self.halted.lock().await;
        self.queue
            .busy_wallets()
            .await
            .iter()
            .all(|wallet| halted.contains(wallet))
    }

    async fn absorb(
        &self,
        joined: Result<StepResult, JoinError>,
        active: &mut HashSet<String>,
        report: &mut DispatchReport,
    ) {
        let (wallet, result) = match joined {
            Ok(step) => step,
            Err(e) => {
                // The wallet stays marked active, which parks its pipeline
                error!(target: ALERT_TARGET, error = %e, "Wallet pipeline task panicked");
                report.errors += 1;
                return;
            }
        };
        active.remove(&wallet);

        match result {
            Ok(StepOutcome::Idle) => {}
            Ok(StepOutcome::Resolved(resolution)) => {
                report.steps += 1;
                match resolution {
                    Resolution::Confirmed { .. } => report.confirmed += 1,
                    Resolution::Requeued { .. } => report.requeued += 1,
                    Resolution::Failed { .. } => report.failed += 1,
                }
            }
            Err(e) if e.is_fatal() => {
                error!(
                    target: ALERT_TARGET,
                    wallet = %wallet,
                    error = %e,
                    "Invariant violation; wallet pipeline halted"
                );
                report.errors += 1;
                self.halted.lock().await.insert(wallet);
            }
            Err(e) => {
                warn!(wallet = %wallet, error = %e, "Wallet step failed");
                report.errors += 1;
                if !self.unstick(&wallet).await {
                    self.stranded.lock().await.insert(wallet);
                }
            }
        }
    }

    /// After a failed step, puts a still-submitted entry back on the retry
    /// path. False when the entry is still stuck in flight.
    async fn unstick(&self, wallet: &str) -> bool {
        let Some(entry) = self.queue.submitted_entry(wallet).await else {
            return true;
        };
        let backoff = self.submitter.policy().backoff(entry.attempts);
        match self.queue.requeue_for_retry(&entry.id, None, backoff).await {
            Ok(_) => {
                debug!(wallet = %wallet, entry_id = %entry.id, "Requeued entry after failed step");
                true
            }
            Err(e) => {
                warn!(wallet = %wallet, entry_id = %entry.id, error = %e, "Entry left in flight");
                false
            }
        }
    }

    async fn retry_stranded(&self, active: &HashSet<String>) {
        let stranded: Vec<String> = self.stranded.lock().await.iter().cloned().collect();
        for wallet in stranded {
            if active.contains(&wallet) {
                continue;
            }
            if self.unstick(&wallet).await {
                self.stranded.lock().await.remove(&wallet);
            }
        }
    }

    async fn maintain(&self) {
        if let Err(e) = self.reconciler.sweep_expired_leases(Utc::now()).await {
            warn!(error = %e, "Lease sweep failed");
        }
        if let Err(e) = self.queue.cleanup(self.maintenance.retention()).await {
            warn!(error = %e, "Queue cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{SimulatedChain, WatchBehavior};
    use crate::config::SequencerConfig;
    use crate::coordinator::RegistrationCoordinator;
    use crate::model::{SigningKeyRef, TxPayload};
    use crate::store::MemoryStore;

    async fn coordinator(chain: Arc<SimulatedChain>) -> RegistrationCoordinator {
        coordinator_on(chain, Arc::new(MemoryStore::new())).await
    }

    async fn coordinator_on(
        chain: Arc<SimulatedChain>,
        store: Arc<MemoryStore>,
    ) -> RegistrationCoordinator {
        let mut config = SequencerConfig::default();
        config.worker.scan_interval_ms = 2;
        config.chain.poll_interval_ms = 1;
        config.retry.base_delay_ms = 1;
        config.retry.jitter = false;
        let coordinator =
            RegistrationCoordinator::open(config, store, chain)
                .await
                .unwrap();
        for address in ["0xaaa", "0xbbb"] {
            coordinator
                .pool()
                .provision(address, SigningKeyRef::new("k"))
                .await
                .unwrap();
        }
        coordinator
    }

    #[tokio::test]
    async fn test_drains_registrations_across_wallets() {
        let chain = Arc::new(SimulatedChain::new());
        let coordinator = coordinator(chain.clone()).await;
        for request in ["req-1", "req-2"] {
            coordinator
                .request_registration(request, TxPayload::registration(serde_json::json!({})))
                .await
                .unwrap_err();
        }

        let report = coordinator
            .dispatcher()
            .run_until_idle(Duration::from_secs(5))
            .await;
        assert_eq!(report.confirmed, 2);
        assert!(report.halted.is_empty());
        assert_eq!(chain.confirmations().len(), 2);
        assert_eq!(coordinator.pool().stats().await.free, 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_loop() {
        let chain = Arc::new(SimulatedChain::new());
        let coordinator = coordinator(chain.clone()).await;
        chain.script_watch("0xaaa", std::iter::repeat(WatchBehavior::Pending).take(3));
        coordinator
            .request_registration("req-1", TxPayload::registration(serde_json::json!({})))
            .await
            .unwrap_err();

        let dispatcher = coordinator.dispatcher();
        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                token.cancel();
            })
        };
        let report = dispatcher.run(token).await;
        canceller.await.unwrap();
        assert_eq!(report.confirmed, 1);
    }

    #[tokio::test]
    async fn test_write_failures_do_not_halt_wallet() {
        let chain = Arc::new(SimulatedChain::new().with_latency(Duration::from_millis(20)));
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator_on(chain.clone(), store.clone()).await;
        coordinator
            .request_registration("req-1", TxPayload::registration(serde_json::json!({})))
            .await
            .unwrap_err();
        // Another signer spends nonces 0..=2, so the step has to resync and write
        chain.set_account_nonce("0xaaa", 3);

        let outage = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                store.set_fail_writes(true);
                tokio::time::sleep(Duration::from_millis(60)).await;
                store.set_fail_writes(false);
            })
        };
        let report = coordinator
            .dispatcher()
            .run_until_idle(Duration::from_secs(5))
            .await;
        outage.await.unwrap();

        assert!(report.halted.is_empty());
        assert!(report.errors >= 1);
        assert_eq!(report.confirmed, 1);
        assert_eq!(chain.confirmed_nonces("0xaaa"), vec![3]);
    }
}
