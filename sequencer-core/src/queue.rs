//! # Transaction Queue
//!
//! One logical queue per wallet. Every status change goes through
//! [`EntryStatus::apply`] and is written to the store before it becomes
//! visible in memory.

use crate::error::QueueError;
use crate::model::{EntryEvent, EntryId, EntryStatus, QueueEntry, TxPayload};
use crate::sequencer::NonceSequencer;
use crate::store::Store;
use crate::utils::lanes::LaneMap;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct WalletLane {
    entries: HashMap<EntryId, QueueEntry>,
}

impl WalletLane {
    fn has_submitted(&self) -> bool {
        self.entries
            .values()
            .any(|e| e.status == EntryStatus::Submitted)
    }

    fn lowest_waiting(&self) -> Option<&QueueEntry> {
        self.entries
            .values()
            .filter(|e| e.status.is_waiting())
            .min_by_key(|e| e.nonce)
    }

    fn unresolved(&self) -> usize {
        self.entries
            .values()
            .filter(|e| !e.status.is_terminal())
            .count()
    }
}

/// What `cancel` did to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Never submitted; failed immediately
    Cancelled,
    /// Already submitted; left to resolve without further retries
    Abandoned,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub submitted: usize,
    pub retrying: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub total: usize,
    pub total_attempts: u64,
    pub wallets: usize,
}

fn transition(entry: &mut QueueEntry, event: EntryEvent) -> Result<(), QueueError> {
    if entry.status == EntryStatus::Confirmed {
        return Err(QueueError::Immutable {
            entry_id: entry.id.clone(),
        });
    }
    let next = entry
        .status
        .apply(event)
        .ok_or_else(|| QueueError::InvalidTransition {
            entry_id: entry.id.clone(),
            from: entry.status,
            event: event.name(),
        })?;
    entry.status = next;
    entry.updated_at = Utc::now();
    Ok(())
}

pub struct TransactionQueue {
    lanes: LaneMap<WalletLane>,
    index: RwLock<HashMap<EntryId, String>>,
    sequencer: Arc<NonceSequencer>,
    store: Arc<dyn Store>,
}

impl TransactionQueue {
    pub fn new(sequencer: Arc<NonceSequencer>, store: Arc<dyn Store>) -> Self {
        Self {
            lanes: LaneMap::new(),
            index: RwLock::new(HashMap::new()),
            sequencer,
            store,
        }
    }

    pub fn sequencer(&self) -> &Arc<NonceSequencer> {
        &self.sequencer
    }

    async fn locate(&self, entry_id: &str) -> Result<Arc<Mutex<WalletLane>>, QueueError> {
        let wallet = self
            .index
            .read()
            .await
            .get(entry_id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound {
                entry_id: entry_id.to_string(),
            })?;
        self.lanes
            .get(&wallet)
            .await
            .ok_or_else(|| QueueError::NotFound {
                entry_id: entry_id.to_string(),
            })
    }

    fn current(lane: &WalletLane, entry_id: &str) -> Result<QueueEntry, QueueError> {
        lane.entries
            .get(entry_id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound {
                entry_id: entry_id.to_string(),
            })
    }

    /// Reserves a nonce and appends a `queued` entry for `wallet_address`.
    pub async fn enqueue(
        &self,
        owner_request_id: &str,
        wallet_address: &str,
        payload: TxPayload,
    ) -> Result<QueueEntry, QueueError> {
        let lane = self
            .lanes
            .get_or_insert_with(wallet_address, WalletLane::default)
            .await;
        let mut lane = lane.lock().await;

        let nonce = self.sequencer.next(wallet_address).await?;
        let entry = QueueEntry::new(owner_request_id, wallet_address, nonce, payload);

        if let Err(e) = self.store.save_entry(&entry).await {
            self.sequencer.recycle(wallet_address, nonce).await;
            return Err(e.into());
        }

        lane.entries.insert(entry.id.clone(), entry.clone());
        self.index
            .write()
            .await
            .insert(entry.id.clone(), wallet_address.to_string());

        info!(
            entry_id = %entry.id,
            request_id = %owner_request_id,
            wallet = %wallet_address,
            nonce,
            "Entry queued"
        );
        Ok(entry)
    }

    /// Moves the lowest-nonce waiting entry to `submitted`.
    ///
    /// Returns `None` when the wallet already has a submitted entry, has
    /// nothing waiting, or its lowest entry is still backing off.
    pub async fn dequeue_next(&self, wallet_address: &str) -> Result<Option<QueueEntry>, QueueError> {
        let Some(lane) = self.lanes.get(wallet_address).await else {
            return Ok(None);
        };
        let mut lane = lane.lock().await;

        if lane.has_submitted() {
            return Ok(None);
        }
        let now = Utc::now();
        let mut entry = match lane.lowest_waiting() {
            Some(e) if e.is_due(now) => e.clone(),
            _ => return Ok(None),
        };

        // A nonce with a transaction out on the chain stays put
        if entry.accepted_hashes.is_empty() {
            if let Some(lower) = self
                .sequencer
                .swap_for_lower(wallet_address, entry.nonce)
                .await
            {
                debug!(entry_id = %entry.id, from = entry.nonce, to = lower, "Entry takes recycled nonce");
                entry.nonce = lower;
            }
        }
        let renonced = entry.nonce;

        transition(&mut entry, EntryEvent::Dispatch)?;
        entry.attempts += 1;
        entry.not_before = None;

        if let Err(e) = self.store.save_entry(&entry).await {
            // Keep the nonce swap; the sequencer already moved
            if let Some(held) = lane.entries.get_mut(&entry.id) {
                held.nonce = renonced;
            }
            return Err(e.into());
        }

        lane.entries.insert(entry.id.clone(), entry.clone());
        debug!(
            entry_id = %entry.id,
            wallet = %wallet_address,
            nonce = entry.nonce,
            attempt = entry.attempts,
            "Entry dispatched"
        );
        Ok(Some(entry))
    }

    /// `submitted|failed → queued` (or `retrying` when `backoff` is non-zero),
    /// keeping the nonce and optionally replacing the payload.
    pub async fn requeue_for_retry(
        &self,
        entry_id: &str,
        new_payload: Option<TxPayload>,
        backoff: Duration,
    ) -> Result<QueueEntry, QueueError> {
        let lane = self.locate(entry_id).await?;
        let mut lane = lane.lock().await;
        let mut entry = Self::current(&lane, entry_id)?;

        let from_failed = entry.status == EntryStatus::Failed;
        let delayed = !backoff.is_zero();
        transition(&mut entry, EntryEvent::Requeue { delayed })?;

        if from_failed {
            self.sequencer
                .reclaim(&entry.wallet_address, entry.nonce)
                .await?;
            entry.attempts = 0;
            entry.abandoned = false;
        }
        if let Some(payload) = new_payload {
            entry.payload = payload;
        }
        entry.not_before = if delayed {
            chrono::Duration::from_std(backoff)
                .ok()
                .map(|d| Utc::now() + d)
        } else {
            None
        };

        if let Err(e) = self.store.save_entry(&entry).await {
            if from_failed {
                self.sequencer
                    .recycle(&entry.wallet_address, entry.nonce)
                    .await;
            }
            return Err(e.into());
        }

        lane.entries.insert(entry.id.clone(), entry.clone());
        debug!(
            entry_id = %entry.id,
            nonce = entry.nonce,
            status = %entry.status,
            backoff_ms = backoff.as_millis() as u64,
            "Entry requeued"
        );
        Ok(entry)
    }

    /// Requeues a submitted entry whose transaction was reorged out or dropped,
    /// under a fresh nonce reservation.
    pub async fn requeue_with_new_nonce(
        &self,
        entry_id: &str,
        backoff: Duration,
    ) -> Result<QueueEntry, QueueError> {
        let lane = self.locate(entry_id).await?;
        let mut lane = lane.lock().await;
        let mut entry = Self::current(&lane, entry_id)?;
        if entry.status != EntryStatus::Submitted {
            return Err(QueueError::InvalidTransition {
                entry_id: entry.id.clone(),
                from: entry.status,
                event: "requeue with new nonce",
            });
        }

        let old_nonce = entry.nonce;
        self.sequencer
            .recycle(&entry.wallet_address, old_nonce)
            .await;
        entry.nonce = match self.sequencer.next(&entry.wallet_address).await {
            Ok(nonce) => nonce,
            Err(e) => {
                self.take_back(&entry.wallet_address, old_nonce).await;
                return Err(e.into());
            }
        };
        entry.accepted_hashes.clear();

        let delayed = !backoff.is_zero();
        transition(&mut entry, EntryEvent::Requeue { delayed })?;
        entry.not_before = if delayed {
            chrono::Duration::from_std(backoff)
                .ok()
                .map(|d| Utc::now() + d)
        } else {
            None
        };

        if let Err(e) = self.store.save_entry(&entry).await {
            self.sequencer
                .recycle(&entry.wallet_address, entry.nonce)
                .await;
            self.take_back(&entry.wallet_address, old_nonce).await;
            return Err(e.into());
        }
        lane.entries.insert(entry.id.clone(), entry.clone());
        info!(
            entry_id = %entry.id,
            wallet = %entry.wallet_address,
            old_nonce,
            nonce = entry.nonce,
            "Entry requeued under new nonce"
        );
        Ok(entry)
    }

    /// Restores the reservation of a nonce the entry still holds after a
    /// failed renonce.
    async fn take_back(&self, wallet_address: &str, nonce: u64) {
        if let Err(e) = self.sequencer.reclaim(wallet_address, nonce).await {
            warn!(wallet = %wallet_address, nonce, error = %e, "Entry keeps a nonce it no longer holds");
        }
    }

    /// Remembers a hash the chain accepted for the entry's current nonce.
    pub async fn record_acceptance(
        &self,
        entry_id: &str,
        tx_hash: &str,
    ) -> Result<QueueEntry, QueueError> {
        let lane = self.locate(entry_id).await?;
        let mut lane = lane.lock().await;
        let mut entry = Self::current(&lane, entry_id)?;
        if entry.status != EntryStatus::Submitted {
            return Err(QueueError::InvalidTransition {
                entry_id: entry.id.clone(),
                from: entry.status,
                event: "record acceptance",
            });
        }
        if !entry.accepted_hashes.iter().any(|h| h == tx_hash) {
            entry.accepted_hashes.push(tx_hash.to_string());
        }
        entry.updated_at = Utc::now();

        self.store.save_entry(&entry).await?;
        lane.entries.insert(entry.id.clone(), entry.clone());
        Ok(entry)
    }

    /// Terminal success. The nonce must be the next one due to confirm.
    pub async fn mark_confirmed(&self, entry_id: &str, tx_hash: &str) -> Result<QueueEntry, QueueError> {
        let lane = self.locate(entry_id).await?;
        let mut lane = lane.lock().await;
        let mut entry = Self::current(&lane, entry_id)?;

        transition(&mut entry, EntryEvent::Confirm)?;
        self.sequencer
            .check_confirmable(&entry.wallet_address, entry.nonce)
            .await?;
        entry.tx_hash = Some(tx_hash.to_string());
        entry.last_error = None;

        self.store.save_entry(&entry).await?;
        self.sequencer
            .record_confirmed(&entry.wallet_address, entry.nonce)
            .await?;
        lane.entries.insert(entry.id.clone(), entry.clone());
        Ok(entry)
    }

    /// Terminal failure. The entry's nonce is recycled.
    pub async fn mark_failed(&self, entry_id: &str, reason: &str) -> Result<QueueEntry, QueueError> {
        let lane = self.locate(entry_id).await?;
        let mut lane = lane.lock().await;
        let mut entry = Self::current(&lane, entry_id)?;

        transition(&mut entry, EntryEvent::Fail)?;
        entry.last_error = Some(reason.to_string());
        entry.not_before = None;

        self.store.save_entry(&entry).await?;
        self.sequencer
            .recycle(&entry.wallet_address, entry.nonce)
            .await;
        lane.entries.insert(entry.id.clone(), entry.clone());
        Ok(entry)
    }

    /// Records the latest failure on a live entry without changing its status.
    pub async fn note_error(&self, entry_id: &str, reason: &str) -> Result<(), QueueError> {
        let lane = self.locate(entry_id).await?;
        let mut lane = lane.lock().await;
        let mut entry = Self::current(&lane, entry_id)?;
        if entry.status.is_terminal() {
            return Ok(());
        }
        entry.last_error = Some(reason.to_string());
        entry.updated_at = Utc::now();
        self.store.save_entry(&entry).await?;
        lane.entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Cancels before submission; after submission the entry is only abandoned.
    pub async fn cancel(&self, entry_id: &str) -> Result<CancelOutcome, QueueError> {
        let lane = self.locate(entry_id).await?;
        let mut lane = lane.lock().await;
        let mut entry = Self::current(&lane, entry_id)?;

        let outcome = match entry.status {
            EntryStatus::Queued | EntryStatus::Retrying => {
                transition(&mut entry, EntryEvent::Fail)?;
                entry.last_error = Some("cancelled".to_string());
                entry.not_before = None;
                CancelOutcome::Cancelled
            }
            EntryStatus::Submitted => {
                entry.abandoned = true;
                entry.updated_at = Utc::now();
                CancelOutcome::Abandoned
            }
            status => {
                return Err(QueueError::NotCancellable {
                    entry_id: entry.id.clone(),
                    status,
                })
            }
        };

        self.store.save_entry(&entry).await?;
        if outcome == CancelOutcome::Cancelled {
            self.sequencer
                .recycle(&entry.wallet_address, entry.nonce)
                .await;
        }
        lane.entries.insert(entry.id.clone(), entry);
        Ok(outcome)
    }

    pub async fn get(&self, entry_id: &str) -> Option<QueueEntry> {
        let lane = self.locate(entry_id).await.ok()?;
        let lane = lane.lock().await;
        lane.entries.get(entry_id).cloned()
    }

    /// All entries for a wallet in nonce order.
    pub async fn entries_for(&self, wallet_address: &str) -> Vec<QueueEntry> {
        let Some(lane) = self.lanes.get(wallet_address).await else {
            return Vec::new();
        };
        let lane = lane.lock().await;
        let mut entries: Vec<QueueEntry> = lane.entries.values().cloned().collect();
        entries.sort_by_key(|e| (e.nonce, e.created_at));
        entries
    }

    pub async fn unresolved_count(&self, wallet_address: &str) -> usize {
        let Some(lane) = self.lanes.get(wallet_address).await else {
            return 0;
        };
        let lane = lane.lock().await;
        lane.unresolved()
    }

    /// True when every entry of the wallet is terminal.
    pub async fn is_drained(&self, wallet_address: &str) -> bool {
        self.unresolved_count(wallet_address).await == 0
    }

    /// Wallets that still have queued, submitted or retrying entries.
    pub async fn busy_wallets(&self) -> HashSet<String> {
        let mut busy = HashSet::new();
        for (wallet, lane) in self.lanes.snapshot().await {
            let lane = lane.lock().await;
            if lane.unresolved() > 0 {
                busy.insert(wallet);
            }
        }
        busy
    }

    /// The wallet's in-flight entry, if any.
    pub async fn submitted_entry(&self, wallet_address: &str) -> Option<QueueEntry> {
        let lane = self.lanes.get(wallet_address).await?;
        let lane = lane.lock().await;
        lane.entries
            .values()
            .find(|e| e.status == EntryStatus::Submitted)
            .cloned()
    }

    /// Wallets whose lowest waiting entry could be dispatched right now.
    pub async fn dispatchable_wallets(&self) -> Vec<String> {
        let now = Utc::now();
        let mut ready = Vec::new();
        for (wallet, lane) in self.lanes.snapshot().await {
            let lane = lane.lock().await;
            if lane.has_submitted() {
                continue;
            }
            if lane.lowest_waiting().is_some_and(|e| e.is_due(now)) {
                ready.push(wallet);
            }
        }
        ready
    }

    pub async fn status(&self) -> QueueStatus {
        let mut status = QueueStatus::default();
        for (_, lane) in self.lanes.snapshot().await {
            let lane = lane.lock().await;
            if !lane.entries.is_empty() {
                status.wallets += 1;
            }
            for entry in lane.entries.values() {
                match entry.status {
                    EntryStatus::Queued => status.queued += 1,
                    EntryStatus::Submitted => status.submitted += 1,
                    EntryStatus::Retrying => status.retrying += 1,
                    EntryStatus::Confirmed => status.confirmed += 1,
                    EntryStatus::Failed => status.failed += 1,
                }
                status.total += 1;
                status.total_attempts += entry.attempts as u64;
            }
        }
        status
    }

    /// Deletes terminal entries last updated more than `max_age` ago.
    pub async fn cleanup(&self, max_age: Duration) -> Result<usize, QueueError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut removed = 0;

        for (wallet, lane) in self.lanes.snapshot().await {
            let mut lane = lane.lock().await;
            let stale: Vec<EntryId> = lane
                .entries
                .values()
                .filter(|e| e.status.is_terminal() && e.updated_at < cutoff)
                .map(|e| e.id.clone())
                .collect();
            if stale.is_empty() {
                continue;
            }

            self.store.delete_entries(&stale).await?;
            let mut index = self.index.write().await;
            for id in &stale {
                lane.entries.remove(id);
                index.remove(id);
            }
            removed += stale.len();
            debug!(wallet = %wallet, removed = stale.len(), "Cleaned up terminal entries");
        }

        if removed > 0 {
            info!("Cleaned up {} terminal queue entries", removed);
        }
        Ok(removed)
    }

    /// Rebuilds the queue and the sequencer from persisted rows.
    ///
    /// Entries caught mid-submission are put back behind the retry path.
    pub(crate) async fn load(
        &self,
        entries: Vec<QueueEntry>,
        stored_nonces: &HashMap<String, Option<u64>>,
    ) -> Result<usize, QueueError> {
        let mut by_wallet: HashMap<String, Vec<QueueEntry>> = HashMap::new();
        for mut entry in entries {
            if entry.status == EntryStatus::Submitted {
                warn!(
                    entry_id = %entry.id,
                    wallet = %entry.wallet_address,
                    nonce = entry.nonce,
                    "Entry was in flight at shutdown; scheduling retry"
                );
                transition(&mut entry, EntryEvent::Requeue { delayed: true })?;
                entry.not_before = Some(Utc::now());
                self.store.save_entry(&entry).await?;
            }
            by_wallet
                .entry(entry.wallet_address.clone())
                .or_default()
                .push(entry);
        }

        let mut loaded = 0;
        let mut wallets: BTreeSet<&String> = stored_nonces.keys().collect();
        wallets.extend(by_wallet.keys());

        for wallet in wallets {
            let list = by_wallet.get(wallet).map(Vec::as_slice).unwrap_or(&[]);
            let outstanding: BTreeSet<u64> = list
                .iter()
                .filter(|e| !e.status.is_terminal())
                .map(|e| e.nonce)
                .collect();
            let highest_confirmed = list
                .iter()
                .filter(|e| e.status == EntryStatus::Confirmed)
                .map(|e| e.nonce)
                .max();
            let recycled: BTreeSet<u64> = list
                .iter()
                .filter(|e| e.status == EntryStatus::Failed)
                .map(|e| e.nonce)
                .filter(|n| highest_confirmed.map_or(true, |c| *n > c))
                .collect();

            self.sequencer
                .restore(
                    wallet,
                    stored_nonces.get(wallet).copied().flatten(),
                    outstanding,
                    recycled,
                    highest_confirmed.map(|c| c + 1),
                )
                .await;

            if list.is_empty() {
                continue;
            }
            let lane = self
                .lanes
                .get_or_insert_with(wallet, WalletLane::default)
                .await;
            let mut lane = lane.lock().await;
            let mut index = self.index.write().await;
            for entry in list {
                index.insert(entry.id.clone(), wallet.clone());
                lane.entries.insert(entry.id.clone(), entry.clone());
                loaded += 1;
            }
        }

        info!("Loaded {} queue entries", loaded);
        Ok(loaded)
    }

    /// Drops all in-memory state after a maintenance purge.
    pub async fn clear(&self) {
        self.lanes.clear().await;
        self.index.write().await.clear();
        self.sequencer.clear().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NonceError;
    use crate::store::MemoryStore;

    fn payload() -> TxPayload {
        TxPayload::registration(serde_json::json!({"tourist": "t-1"}))
    }

    async fn queue_at(tx_count: u64) -> (Arc<MemoryStore>, TransactionQueue) {
        let store = Arc::new(MemoryStore::new());
        let sequencer = Arc::new(NonceSequencer::new(store.clone()));
        sequencer.reconcile("0xaaa", tx_count).await.unwrap();
        (store.clone(), TransactionQueue::new(sequencer, store))
    }

    #[tokio::test]
    async fn test_one_submitted_entry_per_wallet() {
        let (_store, queue) = queue_at(6).await;
        queue.enqueue("req-1", "0xaaa", payload()).await.unwrap();
        queue.enqueue("req-2", "0xaaa", payload()).await.unwrap();

        let first = queue.dequeue_next("0xaaa").await.unwrap().unwrap();
        assert_eq!(first.nonce, 6);
        assert_eq!(first.attempts, 1);
        assert!(queue.dequeue_next("0xaaa").await.unwrap().is_none());

        queue.mark_confirmed(&first.id, "0xhash").await.unwrap();
        let second = queue.dequeue_next("0xaaa").await.unwrap().unwrap();
        assert_eq!(second.nonce, 7);
    }

    #[tokio::test]
    async fn test_failed_nonce_is_taken_by_next_entry() {
        let (_store, queue) = queue_at(6).await;
        let a = queue.enqueue("req-1", "0xaaa", payload()).await.unwrap();
        let b = queue.enqueue("req-2", "0xaaa", payload()).await.unwrap();
        assert_eq!((a.nonce, b.nonce), (6, 7));

        queue.dequeue_next("0xaaa").await.unwrap().unwrap();
        queue.mark_failed(&a.id, "attempts exhausted").await.unwrap();

        let next = queue.dequeue_next("0xaaa").await.unwrap().unwrap();
        assert_eq!(next.id, b.id);
        assert_eq!(next.nonce, 6);
        queue.mark_confirmed(&b.id, "0xhash").await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_keeps_nonce_and_backs_off() {
        let (_store, queue) = queue_at(8).await;
        let entry = queue.enqueue("req-1", "0xaaa", payload()).await.unwrap();
        queue.dequeue_next("0xaaa").await.unwrap().unwrap();

        let requeued = queue
            .requeue_for_retry(&entry.id, None, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(requeued.status, EntryStatus::Retrying);
        assert_eq!(requeued.nonce, 8);
        assert!(queue.dequeue_next("0xaaa").await.unwrap().is_none());

        queue
            .requeue_for_retry(&entry.id, None, Duration::ZERO)
            .await
            .unwrap_err();
    }

    #[tokio::test]
    async fn test_accepted_entry_keeps_its_nonce() {
        let (_store, queue) = queue_at(0).await;
        let orphan = queue.sequencer().next("0xaaa").await.unwrap();
        let entry = queue.enqueue("req-1", "0xaaa", payload()).await.unwrap();
        assert_eq!((orphan, entry.nonce), (0, 1));

        queue.dequeue_next("0xaaa").await.unwrap().unwrap();
        queue.record_acceptance(&entry.id, "0xfirst").await.unwrap();
        let accepted = queue.record_acceptance(&entry.id, "0xfirst").await.unwrap();
        assert_eq!(accepted.accepted_hashes, vec!["0xfirst".to_string()]);
        queue
            .requeue_for_retry(&entry.id, None, Duration::ZERO)
            .await
            .unwrap();
        queue.sequencer().recycle("0xaaa", orphan).await;

        // The first transaction may still be mined at nonce 1
        let again = queue.dequeue_next("0xaaa").await.unwrap().unwrap();
        assert_eq!(again.nonce, 1);

        let renonced = queue
            .requeue_with_new_nonce(&entry.id, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(renonced.nonce, 0);
        assert!(renonced.accepted_hashes.is_empty());
        assert!(queue.record_acceptance(&entry.id, "0xsecond").await.is_err());
    }

    #[tokio::test]
    async fn test_renonce_write_failure_is_not_fatal() {
        let (store, queue) = queue_at(0).await;
        let entry = queue.enqueue("req-1", "0xaaa", payload()).await.unwrap();
        queue.dequeue_next("0xaaa").await.unwrap().unwrap();
        queue.sequencer().reconcile("0xaaa", 1).await.unwrap();

        store.set_fail_writes(true);
        let err = queue
            .requeue_with_new_nonce(&entry.id, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Nonce(NonceError::Store(_))));
        assert!(!crate::error::CoreError::from(err).is_fatal());
        store.set_fail_writes(false);

        let held = queue.get(&entry.id).await.unwrap();
        assert_eq!((held.status, held.nonce), (EntryStatus::Submitted, 0));
        let renonced = queue
            .requeue_with_new_nonce(&entry.id, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(renonced.nonce, 1);
        assert!(queue
            .sequencer()
            .state("0xaaa")
            .await
            .unwrap()
            .recycled
            .is_empty());
    }

    #[tokio::test]
    async fn test_confirmed_is_immutable() {
        let (_store, queue) = queue_at(0).await;
        let entry = queue.enqueue("req-1", "0xaaa", payload()).await.unwrap();
        queue.dequeue_next("0xaaa").await.unwrap();
        queue.mark_confirmed(&entry.id, "0xhash").await.unwrap();

        assert!(matches!(
            queue.mark_failed(&entry.id, "late").await,
            Err(QueueError::Immutable { .. })
        ));
        assert!(matches!(
            queue.requeue_for_retry(&entry.id, None, Duration::ZERO).await,
            Err(QueueError::Immutable { .. })
        ));
        assert_eq!(
            queue.get(&entry.id).await.unwrap().tx_hash.as_deref(),
            Some("0xhash")
        );
    }

    #[tokio::test]
    async fn test_out_of_order_confirmation_is_a_gap() {
        let (_store, queue) = queue_at(5).await;
        let a = queue.enqueue("req-1", "0xaaa", payload()).await.unwrap();
        let b = queue.enqueue("req-2", "0xaaa", payload()).await.unwrap();
        queue.dequeue_next("0xaaa").await.unwrap();
        queue
            .requeue_for_retry(&a.id, None, Duration::from_secs(60))
            .await
            .unwrap();

        // b is waiting, never submitted, so it cannot confirm
        assert!(queue.mark_confirmed(&b.id, "0xhash").await.is_err());

        let entry = queue.get(&a.id).await.unwrap();
        assert_eq!(entry.status, EntryStatus::Retrying);
        let state = queue.sequencer().state("0xaaa").await.unwrap();
        assert_eq!(state.expected_confirm, Some(5));
        assert!(matches!(
            queue.sequencer().check_confirmable("0xaaa", 6).await,
            Err(NonceError::NonceGap { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_entry_can_be_requeued() {
        let (_store, queue) = queue_at(3).await;
        let entry = queue.enqueue("req-1", "0xaaa", payload()).await.unwrap();
        queue.dequeue_next("0xaaa").await.unwrap();
        queue.mark_failed(&entry.id, "rejected").await.unwrap();

        let requeued = queue
            .requeue_for_retry(&entry.id, Some(payload().with_fee_bump(500)), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(requeued.status, EntryStatus::Queued);
        assert_eq!(requeued.nonce, 3);
        assert_eq!(requeued.attempts, 0);
        assert_eq!(requeued.payload.fee_multiplier_bps, 10_500);
    }

    #[tokio::test]
    async fn test_cancel_before_and_after_submission() {
        let (_store, queue) = queue_at(0).await;
        let a = queue.enqueue("req-1", "0xaaa", payload()).await.unwrap();
        let b = queue.enqueue("req-2", "0xaaa", payload()).await.unwrap();
        queue.dequeue_next("0xaaa").await.unwrap();

        assert_eq!(queue.cancel(&a.id).await.unwrap(), CancelOutcome::Abandoned);
        assert_eq!(queue.cancel(&b.id).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(queue.get(&b.id).await.unwrap().status, EntryStatus::Failed);
        assert!(queue.get(&a.id).await.unwrap().abandoned);
        assert!(matches!(
            queue.cancel(&b.id).await,
            Err(QueueError::NotCancellable { .. })
        ));
    }

    #[tokio::test]
    async fn test_store_failure_on_enqueue_recycles_nonce() {
        let (store, queue) = queue_at(4).await;
        store.set_fail_writes(true);
        assert!(queue.enqueue("req-1", "0xaaa", payload()).await.is_err());
        store.set_fail_writes(false);

        let entry = queue.enqueue("req-2", "0xaaa", payload()).await.unwrap();
        assert_eq!(entry.nonce, 4);
    }

    #[tokio::test]
    async fn test_status_and_cleanup() {
        let (store, queue) = queue_at(0).await;
        let a = queue.enqueue("req-1", "0xaaa", payload()).await.unwrap();
        queue.enqueue("req-2", "0xaaa", payload()).await.unwrap();
        queue.dequeue_next("0xaaa").await.unwrap();
        queue.mark_confirmed(&a.id, "0xhash").await.unwrap();

        let status = queue.status().await;
        assert_eq!(status.confirmed, 1);
        assert_eq!(status.queued, 1);
        assert_eq!(status.total, 2);
        assert_eq!(status.total_attempts, 1);
        assert!(queue.busy_wallets().await.contains("0xaaa"));
        assert!(queue.submitted_entry("0xaaa").await.is_none());

        assert_eq!(queue.cleanup(Duration::ZERO).await.unwrap(), 1);
        assert!(queue.get(&a.id).await.is_none());
        assert_eq!(store.load_entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_load_requeues_in_flight_entries() {
        let (store, queue) = queue_at(2).await;
        let entry = queue.enqueue("req-1", "0xaaa", payload()).await.unwrap();
        queue.dequeue_next("0xaaa").await.unwrap();

        let sequencer = Arc::new(NonceSequencer::new(store.clone()));
        let restarted = TransactionQueue::new(sequencer, store.clone());
        let nonces: HashMap<String, Option<u64>> =
            [("0xaaa".to_string(), Some(2))].into_iter().collect();
        let rows = store.load_entries().await.unwrap();
        assert_eq!(restarted.load(rows, &nonces).await.unwrap(), 1);

        let reloaded = restarted.get(&entry.id).await.unwrap();
        assert_eq!(reloaded.status, EntryStatus::Retrying);
        let again = restarted.dequeue_next("0xaaa").await.unwrap().unwrap();
        assert_eq!(again.nonce, 2);
        assert_eq!(again.attempts, 2);
        let next = restarted
            .enqueue("req-2", "0xaaa", payload())
            .await
            .unwrap();
        assert_eq!(next.nonce, 3);
    }
}
