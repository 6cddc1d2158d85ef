//! # Nonce Sequencer
//!
//! Per-wallet nonce issuance. `last_known` is the highest nonce this process has
//! ever issued and never decreases. Nonces given back by permanently failed or
//! dropped transactions are recycled, lowest first, so the confirmed sequence
//! per wallet stays gap-free.

use crate::error::NonceError;
use crate::store::Store;
use crate::utils::lanes::LaneMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Nonce bookkeeping for one wallet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NonceState {
    pub last_known: Option<u64>,
    /// Next nonce expected to confirm on chain
    pub expected_confirm: Option<u64>,
    pub recycled: BTreeSet<u64>,
    /// Issued and not yet confirmed or recycled
    pub outstanding: BTreeSet<u64>,
    /// Highest transaction count seen on chain. Nonces below it are spent.
    pub chain_count: Option<u64>,
}

impl NonceState {
    fn spent(&self, nonce: u64) -> bool {
        self.chain_count.is_some_and(|c| nonce < c)
            || self.expected_confirm.is_some_and(|e| nonce < e)
    }

    /// Moves `expected_confirm` up to the lowest nonce that can still confirm.
    fn raise_expected(&mut self) {
        let Some(count) = self.chain_count else {
            return;
        };
        let floor = self
            .outstanding
            .first()
            .map_or(count, |&lowest| lowest.min(count));
        if self.expected_confirm.map_or(true, |e| e < floor) {
            self.expected_confirm = Some(floor);
        }
    }
}

pub struct NonceSequencer {
    slots: LaneMap<NonceState>,
    store: Arc<dyn Store>,
}

impl NonceSequencer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            slots: LaneMap::new(),
            store,
        }
    }

    /// Reserves the next nonce for `address`.
    pub async fn next(&self, address: &str) -> Result<u64, NonceError> {
        let lane = self
            .slots
            .get_or_insert_with(address, NonceState::default)
            .await;
        let mut slot = lane.lock().await;

        if let Some(nonce) = slot.recycled.pop_first() {
            if !slot.outstanding.insert(nonce) {
                return Err(NonceError::NonceConflict {
                    address: address.to_string(),
                    nonce,
                    reason: "recycled nonce is still outstanding".to_string(),
                });
            }
            debug!(wallet = %address, nonce, "Reissued recycled nonce");
            return Ok(nonce);
        }

        let nonce = match slot.last_known {
            Some(n) => n + 1,
            None => 0,
        };
        if slot.outstanding.contains(&nonce) {
            return Err(NonceError::NonceConflict {
                address: address.to_string(),
                nonce,
                reason: "nonce already issued".to_string(),
            });
        }

        self.store.update_wallet_nonce(address, nonce).await?;
        slot.last_known = Some(nonce);
        slot.outstanding.insert(nonce);
        debug!(wallet = %address, nonce, "Issued nonce");
        Ok(nonce)
    }

    /// Aligns with the chain's transaction count (the next usable nonce).
    ///
    /// The chain value is adopted only when it is ahead of what this process
    /// has issued. Returns the resulting `last_known`.
    pub async fn reconcile(&self, address: &str, tx_count: u64) -> Result<Option<u64>, NonceError> {
        let lane = self
            .slots
            .get_or_insert_with(address, NonceState::default)
            .await;
        let mut slot = lane.lock().await;

        if tx_count > 0 {
            let chain_last = tx_count - 1;
            if slot.last_known.map_or(true, |n| chain_last > n) {
                self.store.update_wallet_nonce(address, chain_last).await?;
                info!(
                    wallet = %address,
                    from = ?slot.last_known,
                    to = chain_last,
                    "Adopted chain nonce"
                );
                slot.last_known = Some(chain_last);
            }
            // Consumed on chain by someone else; never hand these out again
            slot.recycled.retain(|&n| n > chain_last);
        }

        if slot.chain_count.map_or(true, |c| c < tx_count) {
            slot.chain_count = Some(tx_count);
        }
        slot.raise_expected();
        Ok(slot.last_known)
    }

    /// True when the chain's transaction count has already moved past `nonce`.
    pub async fn consumed_on_chain(&self, address: &str, nonce: u64) -> bool {
        let Some(lane) = self.slots.get(address).await else {
            return false;
        };
        let slot = lane.lock().await;
        slot.chain_count.is_some_and(|c| nonce < c)
    }

    /// Gives a reserved nonce back for reuse.
    pub async fn recycle(&self, address: &str, nonce: u64) {
        let lane = self
            .slots
            .get_or_insert_with(address, NonceState::default)
            .await;
        let mut slot = lane.lock().await;

        slot.outstanding.remove(&nonce);
        if slot.spent(nonce) {
            warn!(wallet = %address, nonce, "Not recycling nonce already spent on chain");
            slot.raise_expected();
            return;
        }
        slot.recycled.insert(nonce);
        debug!(wallet = %address, nonce, "Recycled nonce");
    }

    /// Exchanges `held` for a lower recycled nonce, if one exists.
    pub async fn swap_for_lower(&self, address: &str, held: u64) -> Option<u64> {
        let lane = self.slots.get(address).await?;
        let mut slot = lane.lock().await;

        let lower = *slot.recycled.first()?;
        if lower >= held {
            return None;
        }
        slot.recycled.remove(&lower);
        slot.outstanding.remove(&held);
        slot.recycled.insert(held);
        slot.outstanding.insert(lower);
        debug!(wallet = %address, from = held, to = lower, "Swapped for lower nonce");
        Some(lower)
    }

    /// Takes back a nonce that was recycled when its entry failed.
    pub async fn reclaim(&self, address: &str, nonce: u64) -> Result<(), NonceError> {
        let lane = self
            .slots
            .get_or_insert_with(address, NonceState::default)
            .await;
        let mut slot = lane.lock().await;

        if slot.recycled.remove(&nonce) {
            slot.outstanding.insert(nonce);
            return Ok(());
        }
        let reason = if slot.outstanding.contains(&nonce) {
            "nonce was reissued to another entry"
        } else if slot.spent(nonce) {
            "nonce already consumed on chain"
        } else {
            slot.outstanding.insert(nonce);
            return Ok(());
        };
        Err(NonceError::NonceConflict {
            address: address.to_string(),
            nonce,
            reason: reason.to_string(),
        })
    }

    /// Checks that `nonce` is the next one due to confirm, without recording it.
    pub async fn check_confirmable(&self, address: &str, nonce: u64) -> Result<(), NonceError> {
        let Some(lane) = self.slots.get(address).await else {
            return Ok(());
        };
        let slot = lane.lock().await;
        confirm_order(address, &slot, nonce)
    }

    /// Records an on-chain confirmation. Confirmations must arrive in nonce order.
    pub async fn record_confirmed(&self, address: &str, nonce: u64) -> Result<(), NonceError> {
        let lane = self
            .slots
            .get_or_insert_with(address, NonceState::default)
            .await;
        let mut slot = lane.lock().await;
        confirm_order(address, &slot, nonce)?;

        slot.outstanding.remove(&nonce);
        slot.recycled.remove(&nonce);
        slot.expected_confirm = Some(nonce + 1);
        if slot.last_known.map_or(true, |n| n < nonce) {
            slot.last_known = Some(nonce);
        }
        Ok(())
    }

    /// Rebuilds one wallet's state after a restart.
    pub(crate) async fn restore(
        &self,
        address: &str,
        stored_last_known: Option<u64>,
        outstanding: BTreeSet<u64>,
        recycled: BTreeSet<u64>,
        expected_confirm: Option<u64>,
    ) {
        let highest_held = outstanding.last().copied();
        let last_known = match (stored_last_known, highest_held) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let state = NonceState {
            last_known,
            expected_confirm,
            recycled: recycled
                .into_iter()
                .filter(|n| !outstanding.contains(n))
                .collect(),
            outstanding,
            chain_count: None,
        };
        let lane = self
            .slots
            .get_or_insert_with(address, NonceState::default)
            .await;
        *lane.lock().await = state;
    }

    pub async fn last_known(&self, address: &str) -> Option<u64> {
        let lane = self.slots.get(address).await?;
        let slot = lane.lock().await;
        slot.last_known
    }

    pub async fn state(&self, address: &str) -> Option<NonceState> {
        let lane = self.slots.get(address).await?;
        let slot = lane.lock().await;
        Some(slot.clone())
    }

    pub async fn clear(&self) {
        self.slots.clear().await;
    }
}

fn confirm_order(address: &str, slot: &NonceState, nonce: u64) -> Result<(), NonceError> {
    let expected = slot
        .expected_confirm
        .or_else(|| slot.outstanding.first().copied())
        .unwrap_or(nonce);

    if nonce > expected {
        return Err(NonceError::NonceGap {
            address: address.to_string(),
            expected,
            confirmed: nonce,
        });
    }
    if nonce < expected {
        return Err(NonceError::NonceConflict {
            address: address.to_string(),
            nonce,
            reason: format!("already confirmed up to {}", expected - 1),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn sequencer() -> (Arc<MemoryStore>, NonceSequencer) {
        let store = Arc::new(MemoryStore::new());
        let seq = NonceSequencer::new(store.clone());
        (store, seq)
    }

    #[tokio::test]
    async fn test_fresh_wallet_starts_at_chain_count() {
        let (_store, seq) = sequencer();
        seq.reconcile("0xaaa", 4).await.unwrap();
        assert_eq!(seq.next("0xaaa").await.unwrap(), 4);
        assert_eq!(seq.next("0xaaa").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_unknown_fresh_wallet_starts_at_zero() {
        let (_store, seq) = sequencer();
        seq.reconcile("0xaaa", 0).await.unwrap();
        assert_eq!(seq.next("0xaaa").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_keeps_stored_value_when_chain_behind() {
        let (_store, seq) = sequencer();
        seq.reconcile("0xaaa", 6).await.unwrap();
        for _ in 0..3 {
            seq.next("0xaaa").await.unwrap();
        }
        assert_eq!(seq.last_known("0xaaa").await, Some(8));
        assert_eq!(seq.reconcile("0xaaa", 2).await.unwrap(), Some(8));
        assert_eq!(seq.next("0xaaa").await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_reconcile_adopts_chain_when_ahead() {
        let (store, seq) = sequencer();
        store
            .save_wallet(&crate::model::Wallet::new(
                "0xaaa",
                crate::model::SigningKeyRef::new("k"),
            ))
            .await
            .unwrap();
        seq.reconcile("0xaaa", 3).await.unwrap();
        seq.reconcile("0xaaa", 10).await.unwrap();
        assert_eq!(seq.next("0xaaa").await.unwrap(), 10);
        let records = store.load_wallets().await.unwrap();
        assert_eq!(records[0].last_known_nonce, Some(10));
    }

    #[tokio::test]
    async fn test_recycled_nonce_is_reissued_first() {
        let (_store, seq) = sequencer();
        seq.reconcile("0xaaa", 6).await.unwrap();
        let a = seq.next("0xaaa").await.unwrap();
        let b = seq.next("0xaaa").await.unwrap();
        assert_eq!((a, b), (6, 7));

        seq.recycle("0xaaa", 6).await;
        assert_eq!(seq.swap_for_lower("0xaaa", 7).await, Some(6));
        assert_eq!(seq.next("0xaaa").await.unwrap(), 7);
        assert_eq!(seq.last_known("0xaaa").await, Some(7));
    }

    #[tokio::test]
    async fn test_gap_is_reported() {
        let (_store, seq) = sequencer();
        seq.reconcile("0xaaa", 5).await.unwrap();
        seq.next("0xaaa").await.unwrap();
        seq.next("0xaaa").await.unwrap();

        let err = seq.record_confirmed("0xaaa", 6).await.unwrap_err();
        assert_eq!(
            err,
            NonceError::NonceGap {
                address: "0xaaa".to_string(),
                expected: 5,
                confirmed: 6
            }
        );
        seq.record_confirmed("0xaaa", 5).await.unwrap();
        seq.record_confirmed("0xaaa", 6).await.unwrap();
        assert!(matches!(
            seq.record_confirmed("0xaaa", 6).await,
            Err(NonceError::NonceConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_reclaim_after_reissue_conflicts() {
        let (_store, seq) = sequencer();
        seq.reconcile("0xaaa", 0).await.unwrap();
        let n = seq.next("0xaaa").await.unwrap();
        seq.recycle("0xaaa", n).await;
        seq.reclaim("0xaaa", n).await.unwrap();

        seq.recycle("0xaaa", n).await;
        assert_eq!(seq.next("0xaaa").await.unwrap(), n);
        assert!(seq.reclaim("0xaaa", n).await.is_err());
    }

    #[tokio::test]
    async fn test_nonce_spent_on_chain_is_never_recycled() {
        let (_store, seq) = sequencer();
        seq.reconcile("0xaaa", 0).await.unwrap();
        let n = seq.next("0xaaa").await.unwrap();
        seq.next("0xaaa").await.unwrap();

        // Nonce 0 was mined while its entry was still being retried
        seq.reconcile("0xaaa", 1).await.unwrap();
        assert!(seq.consumed_on_chain("0xaaa", n).await);
        seq.recycle("0xaaa", n).await;

        let state = seq.state("0xaaa").await.unwrap();
        assert!(state.recycled.is_empty());
        assert_eq!(state.expected_confirm, Some(1));
        assert_eq!(state.chain_count, Some(1));
        assert_eq!(seq.next("0xaaa").await.unwrap(), 2);
        assert!(seq.reclaim("0xaaa", n).await.is_err());
        seq.record_confirmed("0xaaa", 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_failure_leaves_counter_untouched() {
        let (store, seq) = sequencer();
        seq.reconcile("0xaaa", 2).await.unwrap();
        store.set_fail_writes(true);
        assert!(matches!(
            seq.next("0xaaa").await,
            Err(NonceError::Store(_))
        ));
        store.set_fail_writes(false);
        assert_eq!(seq.next("0xaaa").await.unwrap(), 2);
    }
}
