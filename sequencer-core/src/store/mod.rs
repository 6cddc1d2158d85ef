//! # Persistence
//!
//! Durable wallet, queue entry and outcome tables behind the [`Store`] trait.
//! Every write is a single-entity upsert; components keep their own in-memory
//! state and write through on each transition.

mod sqlite;

pub use sqlite::{SqliteStore, StoreMetricsSnapshot};

use crate::error::StoreError;
use crate::model::{EntryId, QueueEntry, RegistrationOutcome, Wallet, WalletRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Rows removed by a maintenance reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub wallets: u64,
    pub entries: u64,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Upserts the wallet row. Leaves the nonce column untouched.
    async fn save_wallet(&self, wallet: &Wallet) -> Result<(), StoreError>;

    /// Raises the persisted nonce; a lower value is ignored.
    async fn update_wallet_nonce(&self, address: &str, last_known_nonce: u64)
        -> Result<(), StoreError>;

    async fn load_wallets(&self) -> Result<Vec<WalletRecord>, StoreError>;

    async fn save_entry(&self, entry: &QueueEntry) -> Result<(), StoreError>;

    async fn delete_entries(&self, ids: &[EntryId]) -> Result<u64, StoreError>;

    async fn load_entries(&self) -> Result<Vec<QueueEntry>, StoreError>;

    async fn save_outcome(&self, outcome: &RegistrationOutcome) -> Result<(), StoreError>;

    async fn load_outcomes(&self) -> Result<Vec<RegistrationOutcome>, StoreError>;

    /// Bulk-deletes pool and queue rows. Outcome records survive.
    async fn purge_pool_and_queue(&self) -> Result<PurgeReport, StoreError>;
}

#[derive(Default)]
struct MemoryTables {
    wallets: HashMap<String, Wallet>,
    nonces: HashMap<String, u64>,
    entries: HashMap<EntryId, QueueEntry>,
    outcomes: HashMap<String, RegistrationOutcome>,
}

/// In-process store for tests and simulations.
///
/// Writes can be made to fail on demand to exercise rollback paths.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, MemoryTables> {
        // A panic while holding the lock leaves plain maps behind; keep using them
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_write(&self, op: &'static str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database {
                op,
                msg: "writes disabled".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_wallet(&self, wallet: &Wallet) -> Result<(), StoreError> {
        self.check_write("save_wallet")?;
        self.tables()
            .wallets
            .insert(wallet.address.clone(), wallet.clone());
        Ok(())
    }

    async fn update_wallet_nonce(
        &self,
        address: &str,
        last_known_nonce: u64,
    ) -> Result<(), StoreError> {
        self.check_write("update_wallet_nonce")?;
        let mut tables = self.tables();
        let slot = tables.nonces.entry(address.to_string()).or_insert(0);
        *slot = (*slot).max(last_known_nonce);
        Ok(())
    }

    async fn load_wallets(&self) -> Result<Vec<WalletRecord>, StoreError> {
        let tables = self.tables();
        let mut records: Vec<WalletRecord> = tables
            .wallets
            .values()
            .map(|wallet| WalletRecord {
                wallet: wallet.clone(),
                last_known_nonce: tables.nonces.get(&wallet.address).copied(),
            })
            .collect();
        records.sort_by(|a, b| a.wallet.address.cmp(&b.wallet.address));
        Ok(records)
    }

    async fn save_entry(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        self.check_write("save_entry")?;
        self.tables()
            .entries
            .insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn delete_entries(&self, ids: &[EntryId]) -> Result<u64, StoreError> {
        self.check_write("delete_entries")?;
        let mut tables = self.tables();
        let removed = ids
            .iter()
            .filter(|id| tables.entries.remove(id.as_str()).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn load_entries(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let mut entries: Vec<QueueEntry> = self.tables().entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.wallet_address
                .cmp(&b.wallet_address)
                .then(a.nonce.cmp(&b.nonce))
        });
        Ok(entries)
    }

    async fn save_outcome(&self, outcome: &RegistrationOutcome) -> Result<(), StoreError> {
        self.check_write("save_outcome")?;
        self.tables()
            .outcomes
            .insert(outcome.owner_request_id.clone(), outcome.clone());
        Ok(())
    }

    async fn load_outcomes(&self) -> Result<Vec<RegistrationOutcome>, StoreError> {
        Ok(self.tables().outcomes.values().cloned().collect())
    }

    async fn purge_pool_and_queue(&self) -> Result<PurgeReport, StoreError> {
        self.check_write("purge_pool_and_queue")?;
        let mut tables = self.tables();
        let report = PurgeReport {
            wallets: tables.wallets.len() as u64,
            entries: tables.entries.len() as u64,
        };
        tables.wallets.clear();
        tables.nonces.clear();
        tables.entries.clear();
        Ok(report)
    }
}
