//! In-process chain with scriptable behavior.
//!
//! Each wallet has a FIFO of submit behaviors and a FIFO of watch behaviors;
//! an empty script means "accept" and "confirm". Confirmation only succeeds for
//! the account's next nonce, like a real chain.

use super::{AcceptanceReceipt, ChainClient, ConfirmationStatus};
use crate::error::{ChainError, RejectionKind};
use crate::model::{SigningKeyRef, TxPayload};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Depth reported for a mined transaction
const MINED_DEPTH: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitBehavior {
    Accept,
    Reject(RejectionKind),
    /// Never answers within any sane timeout
    Stall(Duration),
    Transport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchBehavior {
    Confirm,
    Pending,
    Reorg,
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub wallet_address: String,
    pub nonce: u64,
    pub tx_hash: String,
    pub fee_multiplier_bps: u32,
}

#[derive(Default)]
struct SimState {
    account_nonces: HashMap<String, u64>,
    submit_scripts: HashMap<String, VecDeque<SubmitBehavior>>,
    watch_scripts: HashMap<String, VecDeque<WatchBehavior>>,
    nonce_query_failures: u32,
    pending: HashSet<String>,
    submissions: Vec<SubmissionRecord>,
    confirmations: Vec<SubmissionRecord>,
}

pub struct SimulatedChain {
    state: Mutex<SimState>,
    latency: Duration,
    reject_rate: f64,
    drop_rate: f64,
}

impl Default for SimulatedChain {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            latency: Duration::ZERO,
            reject_rate: 0.0,
            drop_rate: 0.0,
        }
    }

    /// Delay applied to every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Random underpriced rejections and drops for unscripted calls
    pub fn with_fault_rates(mut self, reject_rate: f64, drop_rate: f64) -> Self {
        self.reject_rate = reject_rate.clamp(0.0, 1.0);
        self.drop_rate = drop_rate.clamp(0.0, 1.0);
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_account_nonce(&self, wallet_address: &str, tx_count: u64) {
        self.state()
            .account_nonces
            .insert(wallet_address.to_string(), tx_count);
    }

    pub fn script_submit(&self, wallet_address: &str, behaviors: impl IntoIterator<Item = SubmitBehavior>) {
        self.state()
            .submit_scripts
            .entry(wallet_address.to_string())
            .or_default()
            .extend(behaviors);
    }

    pub fn script_watch(&self, wallet_address: &str, behaviors: impl IntoIterator<Item = WatchBehavior>) {
        self.state()
            .watch_scripts
            .entry(wallet_address.to_string())
            .or_default()
            .extend(behaviors);
    }

    /// Mines a pending transaction outside of any confirmation poll, as a
    /// block producer would. False unless its nonce is the account's next.
    pub fn mine(&self, tx_hash: &str) -> bool {
        let mut guard = self.state();
        let state = &mut *guard;
        if !state.pending.contains(tx_hash) {
            return false;
        }
        let Some(record) = state
            .submissions
            .iter()
            .find(|r| r.tx_hash == tx_hash)
            .cloned()
        else {
            return false;
        };
        matches!(
            mine_pending(state, &record.wallet_address, record.nonce, tx_hash),
            ConfirmationStatus::Confirmed { .. }
        )
    }

    /// The next `count` nonce queries fail with a transport error.
    pub fn fail_nonce_queries(&self, count: u32) {
        self.state().nonce_query_failures = count;
    }

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state().submissions.clone()
    }

    pub fn confirmations(&self) -> Vec<SubmissionRecord> {
        self.state().confirmations.clone()
    }

    pub fn confirmed_nonces(&self, wallet_address: &str) -> Vec<u64> {
        self.state()
            .confirmations
            .iter()
            .filter(|r| r.wallet_address == wallet_address)
            .map(|r| r.nonce)
            .collect()
    }

    fn next_submit(&self, wallet_address: &str) -> SubmitBehavior {
        let scripted = self
            .state()
            .submit_scripts
            .get_mut(wallet_address)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(behavior) => behavior,
            None if self.reject_rate > 0.0 && rand::thread_rng().gen_bool(self.reject_rate) => {
                SubmitBehavior::Reject(RejectionKind::Underpriced)
            }
            None => SubmitBehavior::Accept,
        }
    }

    fn next_watch(&self, wallet_address: &str) -> WatchBehavior {
        let scripted = self
            .state()
            .watch_scripts
            .get_mut(wallet_address)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(behavior) => behavior,
            None if self.drop_rate > 0.0 && rand::thread_rng().gen_bool(self.drop_rate) => {
                WatchBehavior::Drop
            }
            None => WatchBehavior::Confirm,
        }
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

fn mine_pending(
    state: &mut SimState,
    wallet_address: &str,
    nonce: u64,
    tx_hash: &str,
) -> ConfirmationStatus {
    let account_nonce = state
        .account_nonces
        .entry(wallet_address.to_string())
        .or_insert(0);
    if nonce > *account_nonce {
        return ConfirmationStatus::Pending { depth: 0 };
    }
    if nonce < *account_nonce {
        // Slot taken by another transaction
        state.pending.remove(tx_hash);
        return ConfirmationStatus::Dropped;
    }
    *account_nonce += 1;
    state.pending.remove(tx_hash);
    state.confirmations.push(SubmissionRecord {
        wallet_address: wallet_address.to_string(),
        nonce,
        tx_hash: tx_hash.to_string(),
        fee_multiplier_bps: 0,
    });
    ConfirmationStatus::Confirmed { depth: MINED_DEPTH }
}

fn random_tx_hash() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    format!("0x{}", hex::encode(bytes))
}

#[async_trait]
impl ChainClient for SimulatedChain {
    async fn submit(
        &self,
        wallet_address: &str,
        _signing_key_ref: &SigningKeyRef,
        nonce: u64,
        payload: &TxPayload,
    ) -> Result<AcceptanceReceipt, ChainError> {
        self.simulate_latency().await;

        match self.next_submit(wallet_address) {
            SubmitBehavior::Accept => {}
            SubmitBehavior::Reject(kind) => {
                return Err(ChainError::SubmissionRejected {
                    kind,
                    reason: format!("simulated {} rejection", kind),
                })
            }
            SubmitBehavior::Stall(duration) => {
                tokio::time::sleep(duration).await;
            }
            SubmitBehavior::Transport => {
                return Err(ChainError::Transport {
                    reason: "simulated connection reset".to_string(),
                })
            }
        }

        let mut guard = self.state();
        let state = &mut *guard;
        let account_nonce = state
            .account_nonces
            .get(wallet_address)
            .copied()
            .unwrap_or(0);
        if nonce < account_nonce {
            return Err(ChainError::SubmissionRejected {
                kind: RejectionKind::NonceTooLow,
                reason: format!("nonce {} below account nonce {}", nonce, account_nonce),
            });
        }

        let tx_hash = random_tx_hash();
        state.pending.insert(tx_hash.clone());
        state.submissions.push(SubmissionRecord {
            wallet_address: wallet_address.to_string(),
            nonce,
            tx_hash: tx_hash.clone(),
            fee_multiplier_bps: payload.fee_multiplier_bps,
        });
        debug!(wallet = %wallet_address, nonce, tx_hash = %tx_hash, "Simulated submission accepted");

        Ok(AcceptanceReceipt {
            tx_hash,
            wallet_address: wallet_address.to_string(),
            nonce,
            accepted_at: Utc::now(),
        })
    }

    async fn account_nonce(&self, wallet_address: &str) -> Result<u64, ChainError> {
        self.simulate_latency().await;

        let mut state = self.state();
        if state.nonce_query_failures > 0 {
            state.nonce_query_failures -= 1;
            return Err(ChainError::Transport {
                reason: "simulated nonce query failure".to_string(),
            });
        }
        Ok(state
            .account_nonces
            .get(wallet_address)
            .copied()
            .unwrap_or(0))
    }

    async fn watch_confirmation(
        &self,
        receipt: &AcceptanceReceipt,
    ) -> Result<ConfirmationStatus, ChainError> {
        self.simulate_latency().await;

        {
            let state = self.state();
            if state
                .confirmations
                .iter()
                .any(|r| r.tx_hash == receipt.tx_hash)
            {
                return Ok(ConfirmationStatus::Confirmed { depth: MINED_DEPTH });
            }
            if !state.pending.contains(&receipt.tx_hash) {
                return Ok(ConfirmationStatus::Dropped);
            }
        }

        let behavior = self.next_watch(&receipt.wallet_address);
        let mut guard = self.state();
        let state = &mut *guard;

        match behavior {
            WatchBehavior::Pending => Ok(ConfirmationStatus::Pending { depth: 0 }),
            WatchBehavior::Reorg => {
                state.pending.remove(&receipt.tx_hash);
                Ok(ConfirmationStatus::Reorged)
            }
            WatchBehavior::Drop => {
                state.pending.remove(&receipt.tx_hash);
                Ok(ConfirmationStatus::Dropped)
            }
            WatchBehavior::Confirm => Ok(mine_pending(
                state,
                &receipt.wallet_address,
                receipt.nonce,
                &receipt.tx_hash,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SigningKeyRef {
        SigningKeyRef::new("k")
    }

    fn payload() -> TxPayload {
        TxPayload::registration(serde_json::json!({}))
    }

    #[tokio::test]
    async fn test_confirms_in_nonce_order_only() {
        let chain = SimulatedChain::new();
        chain.set_account_nonce("0xaaa", 3);
        let r4 = chain.submit("0xaaa", &key(), 4, &payload()).await.unwrap();
        let r3 = chain.submit("0xaaa", &key(), 3, &payload()).await.unwrap();

        assert_eq!(
            chain.watch_confirmation(&r4).await.unwrap(),
            ConfirmationStatus::Pending { depth: 0 }
        );
        assert!(matches!(
            chain.watch_confirmation(&r3).await.unwrap(),
            ConfirmationStatus::Confirmed { .. }
        ));
        assert!(matches!(
            chain.watch_confirmation(&r4).await.unwrap(),
            ConfirmationStatus::Confirmed { .. }
        ));
        assert_eq!(chain.account_nonce("0xaaa").await.unwrap(), 5);
        assert_eq!(chain.confirmed_nonces("0xaaa"), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_scripts_run_in_order() {
        let chain = SimulatedChain::new();
        chain.script_submit(
            "0xaaa",
            [
                SubmitBehavior::Reject(RejectionKind::Underpriced),
                SubmitBehavior::Transport,
            ],
        );
        assert!(matches!(
            chain.submit("0xaaa", &key(), 0, &payload()).await,
            Err(ChainError::SubmissionRejected {
                kind: RejectionKind::Underpriced,
                ..
            })
        ));
        assert!(matches!(
            chain.submit("0xaaa", &key(), 0, &payload()).await,
            Err(ChainError::Transport { .. })
        ));
        assert!(chain.submit("0xaaa", &key(), 0, &payload()).await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_nonce_is_rejected() {
        let chain = SimulatedChain::new();
        chain.set_account_nonce("0xaaa", 2);
        assert!(matches!(
            chain.submit("0xaaa", &key(), 1, &payload()).await,
            Err(ChainError::SubmissionRejected {
                kind: RejectionKind::NonceTooLow,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_nonce_query_failures() {
        let chain = SimulatedChain::new();
        chain.fail_nonce_queries(1);
        assert!(chain.account_nonce("0xaaa").await.is_err());
        assert_eq!(chain.account_nonce("0xaaa").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mined_transaction_stays_confirmed() {
        let chain = SimulatedChain::new();
        chain.script_watch("0xaaa", [WatchBehavior::Pending]);
        let first = chain.submit("0xaaa", &key(), 0, &payload()).await.unwrap();
        assert_eq!(
            chain.watch_confirmation(&first).await.unwrap(),
            ConfirmationStatus::Pending { depth: 0 }
        );

        let second = chain.submit("0xaaa", &key(), 0, &payload()).await.unwrap();
        assert!(chain.mine(&first.tx_hash));
        assert!(!chain.mine(&second.tx_hash));

        assert_eq!(
            chain.watch_confirmation(&first).await.unwrap(),
            ConfirmationStatus::Confirmed { depth: 1 }
        );
        assert_eq!(
            chain.watch_confirmation(&second).await.unwrap(),
            ConfirmationStatus::Dropped
        );
        assert!(matches!(
            chain.submit("0xaaa", &key(), 0, &payload()).await,
            Err(ChainError::SubmissionRejected {
                kind: RejectionKind::NonceTooLow,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_reorged_transaction_never_confirms() {
        let chain = SimulatedChain::new();
        chain.script_watch("0xaaa", [WatchBehavior::Reorg]);
        let receipt = chain.submit("0xaaa", &key(), 0, &payload()).await.unwrap();
        assert_eq!(
            chain.watch_confirmation(&receipt).await.unwrap(),
            ConfirmationStatus::Reorged
        );
        assert_eq!(
            chain.watch_confirmation(&receipt).await.unwrap(),
            ConfirmationStatus::Dropped
        );
        assert!(chain.confirmations().is_empty());
    }
}
