use super::{PurgeReport, Store};
use crate::error::{FailureCode, StoreError};
use crate::model::{
    EntryId, EntryStatus, Lease, OutcomeStatus, QueueEntry, RegistrationOutcome, SigningKeyRef,
    TxPayload, Wallet, WalletRecord, WalletState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, Default)]
struct StoreMetrics {
    total_queries: AtomicU64,
    total_errors: AtomicU64,
    total_writes: AtomicU64,
    total_reads: AtomicU64,
    avg_query_time_ms: AtomicU64,
    query_count_for_avg: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct StoreMetricsSnapshot {
    pub total_queries: u64,
    pub total_errors: u64,
    pub total_writes: u64,
    pub total_reads: u64,
    pub avg_query_time_ms: u64,
}

impl StoreMetricsSnapshot {
    pub fn error_rate(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.total_errors as f64 / self.total_queries as f64 * 100.0
        }
    }
}

#[derive(sqlx::FromRow)]
struct WalletRow {
    address: String,
    signing_key_ref: String,
    state: String,
    lease_owner: Option<String>,
    leased_at: Option<i64>,
    lease_expires_at: Option<i64>,
    last_released_at: Option<i64>,
    retired_reason: Option<String>,
    last_known_nonce: Option<i64>,
    created_at: i64,
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: String,
    owner_request_id: String,
    wallet_address: String,
    nonce: i64,
    payload: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    tx_hash: Option<String>,
    accepted_hashes: String,
    not_before: Option<i64>,
    abandoned: i64,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct OutcomeRow {
    owner_request_id: String,
    wallet_address: String,
    entry_id: Option<String>,
    transaction_hash: Option<String>,
    status: String,
    failure_code: Option<String>,
    created_at: i64,
    updated_at: i64,
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(table: &'static str, key: &str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
        table,
        key: key.to_string(),
        reason: format!("timestamp {} out of range", ms),
    })
}

fn corrupt(table: &'static str, key: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        table,
        key: key.to_string(),
        reason: reason.into(),
    }
}

impl TryFrom<WalletRow> for WalletRecord {
    type Error = StoreError;

    fn try_from(row: WalletRow) -> Result<Self, Self::Error> {
        let key = row.address.as_str();
        let state = WalletState::parse(&row.state)
            .ok_or_else(|| corrupt("wallets", key, format!("unknown state '{}'", row.state)))?;
        let lease = match (row.lease_owner, row.leased_at, row.lease_expires_at) {
            (Some(owner), Some(at), Some(expires)) => Some(Lease {
                owner_request_id: owner,
                leased_at: from_millis("wallets", key, at)?,
                expires_at: from_millis("wallets", key, expires)?,
            }),
            (None, None, None) => None,
            _ => return Err(corrupt("wallets", key, "partial lease columns")),
        };
        if (state == WalletState::Leased) != lease.is_some() {
            return Err(corrupt("wallets", key, "lease does not match state"));
        }
        let last_released_at = row
            .last_released_at
            .map(|ms| from_millis("wallets", key, ms))
            .transpose()?;
        let last_known_nonce = match row.last_known_nonce {
            Some(n) if n < 0 => return Err(corrupt("wallets", key, "negative nonce")),
            other => other.map(|n| n as u64),
        };
        let created_at = from_millis("wallets", key, row.created_at)?;

        Ok(WalletRecord {
            wallet: Wallet {
                signing_key_ref: SigningKeyRef::new(row.signing_key_ref),
                state,
                lease,
                last_released_at,
                retired_reason: row.retired_reason,
                created_at,
                address: row.address,
            },
            last_known_nonce,
        })
    }
}

impl TryFrom<EntryRow> for QueueEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let key = row.id.as_str();
        let status = EntryStatus::parse(&row.status)
            .ok_or_else(|| corrupt("queue_entries", key, format!("unknown status '{}'", row.status)))?;
        let payload: TxPayload = serde_json::from_str(&row.payload)
            .map_err(|e| corrupt("queue_entries", key, format!("payload: {}", e)))?;
        let accepted_hashes: Vec<String> = serde_json::from_str(&row.accepted_hashes)
            .map_err(|e| corrupt("queue_entries", key, format!("accepted_hashes: {}", e)))?;
        if row.nonce < 0 || row.attempts < 0 {
            return Err(corrupt("queue_entries", key, "negative nonce or attempts"));
        }
        let not_before = row
            .not_before
            .map(|ms| from_millis("queue_entries", key, ms))
            .transpose()?;
        let created_at = from_millis("queue_entries", key, row.created_at)?;
        let updated_at = from_millis("queue_entries", key, row.updated_at)?;

        Ok(QueueEntry {
            owner_request_id: row.owner_request_id,
            wallet_address: row.wallet_address,
            nonce: row.nonce as u64,
            payload,
            status,
            attempts: row.attempts as u32,
            last_error: row.last_error,
            tx_hash: row.tx_hash,
            accepted_hashes,
            not_before,
            abandoned: row.abandoned != 0,
            created_at,
            updated_at,
            id: row.id,
        })
    }
}

impl TryFrom<OutcomeRow> for RegistrationOutcome {
    type Error = StoreError;

    fn try_from(row: OutcomeRow) -> Result<Self, Self::Error> {
        let key = row.owner_request_id.as_str();
        let status = OutcomeStatus::parse(&row.status).ok_or_else(|| {
            corrupt("registration_outcomes", key, format!("unknown status '{}'", row.status))
        })?;
        let failure = match row.failure_code.as_deref() {
            Some(code) => Some(FailureCode::parse(code).ok_or_else(|| {
                corrupt("registration_outcomes", key, format!("unknown code '{}'", code))
            })?),
            None => None,
        };
        let created_at = from_millis("registration_outcomes", key, row.created_at)?;
        let updated_at = from_millis("registration_outcomes", key, row.updated_at)?;

        Ok(RegistrationOutcome {
            wallet_address: row.wallet_address,
            entry_id: row.entry_id,
            transaction_hash: row.transaction_hash,
            status,
            failure,
            created_at,
            updated_at,
            owner_request_id: row.owner_request_id,
        })
    }
}

/// SQLite-backed [`Store`]. Not `Clone`; share it as `Arc<SqliteStore>`.
#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    metrics: StoreMetrics,
}

impl SqliteStore {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 20;
    pub const DEFAULT_TIMEOUT_MS: u64 = 30000;

    pub async fn open(db_path: &str) -> Result<Self, StoreError> {
        if !Path::new(db_path).exists() {
            std::fs::File::create(db_path).map_err(|e| StoreError::Database {
                op: "create_file",
                msg: format!("{}: {}", db_path, e),
            })?;
            info!("Created new database file: {}", db_path);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(Self::DEFAULT_MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_millis(Self::DEFAULT_TIMEOUT_MS))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA journal_mode=WAL;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA synchronous=NORMAL;")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("sqlite://{}", db_path))
            .await
            .map_err(|e| StoreError::Database {
                op: "connect",
                msg: e.to_string(),
            })?;

        let store = Self {
            pool,
            metrics: StoreMetrics::default(),
        };
        store.init_schema().await?;
        info!(
            "Store initialized with pool size {} (WAL Mode)",
            Self::DEFAULT_MAX_CONNECTIONS
        );
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS wallets (
                address TEXT PRIMARY KEY,
                signing_key_ref TEXT NOT NULL,
                state TEXT NOT NULL,
                lease_owner TEXT,
                leased_at INTEGER,
                lease_expires_at INTEGER,
                last_released_at INTEGER,
                retired_reason TEXT,
                last_known_nonce INTEGER,
                created_at INTEGER NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS queue_entries (
                id TEXT PRIMARY KEY,
                owner_request_id TEXT NOT NULL,
                wallet_address TEXT NOT NULL,
                nonce INTEGER NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                tx_hash TEXT,
                accepted_hashes TEXT NOT NULL DEFAULT '[]',
                not_before INTEGER,
                abandoned INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS registration_outcomes (
                owner_request_id TEXT PRIMARY KEY,
                wallet_address TEXT NOT NULL,
                entry_id TEXT,
                transaction_hash TEXT,
                status TEXT NOT NULL,
                failure_code TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        ];

        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Database {
                    op: "init_schema",
                    msg: e.to_string(),
                })?;
        }

        self.create_indexes().await;
        info!("Store schema initialized with indexes.");
        Ok(())
    }

    async fn create_indexes(&self) {
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_wallets_state ON wallets(state);",
            "CREATE INDEX IF NOT EXISTS idx_entries_wallet_nonce ON queue_entries(wallet_address, nonce);",
            "CREATE INDEX IF NOT EXISTS idx_entries_status ON queue_entries(status);",
            "CREATE INDEX IF NOT EXISTS idx_entries_owner ON queue_entries(owner_request_id);",
            "CREATE INDEX IF NOT EXISTS idx_outcomes_wallet ON registration_outcomes(wallet_address);",
        ];

        for idx_sql in indexes {
            if let Err(e) = sqlx::query(idx_sql).execute(&self.pool).await {
                debug!("Index creation skipped (may exist): {}", e);
            }
        }
    }

    pub fn metrics(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            total_queries: self.metrics.total_queries.load(Ordering::SeqCst),
            total_errors: self.metrics.total_errors.load(Ordering::SeqCst),
            total_writes: self.metrics.total_writes.load(Ordering::SeqCst),
            total_reads: self.metrics.total_reads.load(Ordering::SeqCst),
            avg_query_time_ms: self.metrics.avg_query_time_ms.load(Ordering::SeqCst),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Books one finished query and converts its error.
    fn finish<T>(
        &self,
        op: &'static str,
        start: std::time::Instant,
        write: bool,
        result: Result<T, sqlx::Error>,
    ) -> Result<T, StoreError> {
        let counter = if write {
            &self.metrics.total_writes
        } else {
            &self.metrics.total_reads
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.record_query_time(start, result.is_ok());

        match result {
            Ok(value) => {
                self.metrics.total_queries.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
            Err(e) => {
                self.metrics.total_queries.fetch_add(1, Ordering::SeqCst);
                self.metrics.total_errors.fetch_add(1, Ordering::SeqCst);
                error!("Store operation {} failed: {}", op, e);
                Err(StoreError::Database {
                    op,
                    msg: e.to_string(),
                })
            }
        }
    }

    fn record_query_time(&self, start: std::time::Instant, success: bool) {
        let elapsed_ms = start.elapsed().as_millis() as u64;
        let count = self.metrics.query_count_for_avg.load(Ordering::SeqCst);
        let current_avg = self.metrics.avg_query_time_ms.load(Ordering::SeqCst);

        if success {
            let new_count = count + 1;
            let new_avg = if count == 0 {
                elapsed_ms
            } else {
                (current_avg * count + elapsed_ms) / new_count
            };
            self.metrics
                .query_count_for_avg
                .store(new_count, Ordering::SeqCst);
            self.metrics
                .avg_query_time_ms
                .store(new_avg, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_wallet(&self, wallet: &Wallet) -> Result<(), StoreError> {
        let start = std::time::Instant::now();
        let lease = wallet.lease.as_ref();

        let result = sqlx::query(
            "INSERT INTO wallets (address, signing_key_ref, state, lease_owner, leased_at, lease_expires_at, last_released_at, retired_reason, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(address) DO UPDATE SET
                signing_key_ref = excluded.signing_key_ref,
                state = excluded.state,
                lease_owner = excluded.lease_owner,
                leased_at = excluded.leased_at,
                lease_expires_at = excluded.lease_expires_at,
                last_released_at = excluded.last_released_at,
                retired_reason = excluded.retired_reason",
        )
        .bind(&wallet.address)
        .bind(wallet.signing_key_ref.expose())
        .bind(wallet.state.as_str())
        .bind(lease.map(|l| l.owner_request_id.as_str()))
        .bind(lease.map(|l| millis(l.leased_at)))
        .bind(lease.map(|l| millis(l.expires_at)))
        .bind(wallet.last_released_at.map(millis))
        .bind(wallet.retired_reason.as_deref())
        .bind(millis(wallet.created_at))
        .execute(&self.pool)
        .await;

        self.finish("save_wallet", start, true, result).map(|_| ())
    }

    async fn update_wallet_nonce(
        &self,
        address: &str,
        last_known_nonce: u64,
    ) -> Result<(), StoreError> {
        let start = std::time::Instant::now();

        let result = sqlx::query(
            "UPDATE wallets SET last_known_nonce = MAX(COALESCE(last_known_nonce, -1), ?) WHERE address = ?",
        )
        .bind(last_known_nonce as i64)
        .bind(address)
        .execute(&self.pool)
        .await;

        self.finish("update_wallet_nonce", start, true, result)
            .map(|_| ())
    }

    async fn load_wallets(&self) -> Result<Vec<WalletRecord>, StoreError> {
        let start = std::time::Instant::now();

        let rows = sqlx::query_as::<_, WalletRow>(
            "SELECT address, signing_key_ref, state, lease_owner, leased_at, lease_expires_at, last_released_at, retired_reason, last_known_nonce, created_at FROM wallets ORDER BY address",
        )
        .fetch_all(&self.pool)
        .await;

        self.finish("load_wallets", start, false, rows)?
            .into_iter()
            .map(WalletRecord::try_from)
            .collect()
    }

    async fn save_entry(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        let start = std::time::Instant::now();
        let payload = serde_json::to_string(&entry.payload).map_err(|e| StoreError::Database {
            op: "save_entry",
            msg: format!("payload encoding: {}", e),
        })?;
        let accepted_hashes =
            serde_json::to_string(&entry.accepted_hashes).map_err(|e| StoreError::Database {
                op: "save_entry",
                msg: format!("accepted hashes encoding: {}", e),
            })?;

        let result = sqlx::query(
            "INSERT INTO queue_entries (id, owner_request_id, wallet_address, nonce, payload, status, attempts, last_error, tx_hash, accepted_hashes, not_before, abandoned, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                nonce = excluded.nonce,
                payload = excluded.payload,
                status = excluded.status,
                attempts = excluded.attempts,
                last_error = excluded.last_error,
                tx_hash = excluded.tx_hash,
                accepted_hashes = excluded.accepted_hashes,
                not_before = excluded.not_before,
                abandoned = excluded.abandoned,
                updated_at = excluded.updated_at
             WHERE queue_entries.status != 'confirmed'",
        )
        .bind(&entry.id)
        .bind(&entry.owner_request_id)
        .bind(&entry.wallet_address)
        .bind(entry.nonce as i64)
        .bind(payload)
        .bind(entry.status.as_str())
        .bind(entry.attempts as i64)
        .bind(entry.last_error.as_deref())
        .bind(entry.tx_hash.as_deref())
        .bind(accepted_hashes)
        .bind(entry.not_before.map(millis))
        .bind(entry.abandoned as i64)
        .bind(millis(entry.created_at))
        .bind(millis(entry.updated_at))
        .execute(&self.pool)
        .await;

        self.finish("save_entry", start, true, result).map(|_| ())
    }

    async fn delete_entries(&self, ids: &[EntryId]) -> Result<u64, StoreError> {
        let mut deleted = 0;
        for id in ids {
            let start = std::time::Instant::now();
            let result = sqlx::query("DELETE FROM queue_entries WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await;
            deleted += self
                .finish("delete_entries", start, true, result)?
                .rows_affected();
        }
        Ok(deleted)
    }

    async fn load_entries(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let start = std::time::Instant::now();

        let rows = sqlx::query_as::<_, EntryRow>(
            "SELECT id, owner_request_id, wallet_address, nonce, payload, status, attempts, last_error, tx_hash, accepted_hashes, not_before, abandoned, created_at, updated_at FROM queue_entries ORDER BY wallet_address, nonce",
        )
        .fetch_all(&self.pool)
        .await;

        self.finish("load_entries", start, false, rows)?
            .into_iter()
            .map(QueueEntry::try_from)
            .collect()
    }

    async fn save_outcome(&self, outcome: &RegistrationOutcome) -> Result<(), StoreError> {
        let start = std::time::Instant::now();

        let result = sqlx::query(
            "INSERT INTO registration_outcomes (owner_request_id, wallet_address, entry_id, transaction_hash, status, failure_code, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(owner_request_id) DO UPDATE SET
                wallet_address = excluded.wallet_address,
                entry_id = excluded.entry_id,
                transaction_hash = excluded.transaction_hash,
                status = excluded.status,
                failure_code = excluded.failure_code,
                updated_at = excluded.updated_at",
        )
        .bind(&outcome.owner_request_id)
        .bind(&outcome.wallet_address)
        .bind(outcome.entry_id.as_deref())
        .bind(outcome.transaction_hash.as_deref())
        .bind(outcome.status.as_str())
        .bind(outcome.failure.map(|c| c.as_str()))
        .bind(millis(outcome.created_at))
        .bind(millis(outcome.updated_at))
        .execute(&self.pool)
        .await;

        self.finish("save_outcome", start, true, result).map(|_| ())
    }

    async fn load_outcomes(&self) -> Result<Vec<RegistrationOutcome>, StoreError> {
        let start = std::time::Instant::now();

        let rows = sqlx::query_as::<_, OutcomeRow>(
            "SELECT owner_request_id, wallet_address, entry_id, transaction_hash, status, failure_code, created_at, updated_at FROM registration_outcomes",
        )
        .fetch_all(&self.pool)
        .await;

        self.finish("load_outcomes", start, false, rows)?
            .into_iter()
            .map(RegistrationOutcome::try_from)
            .collect()
    }

    async fn purge_pool_and_queue(&self) -> Result<PurgeReport, StoreError> {
        let start = std::time::Instant::now();
        let entries = sqlx::query("DELETE FROM queue_entries")
            .execute(&self.pool)
            .await;
        let entries = self
            .finish("purge_pool_and_queue", start, true, entries)?
            .rows_affected();

        let start = std::time::Instant::now();
        let wallets = sqlx::query("DELETE FROM wallets").execute(&self.pool).await;
        let wallets = self
            .finish("purge_pool_and_queue", start, true, wallets)?
            .rows_affected();

        info!(wallets, entries, "Purged pool and queue tables");
        Ok(PurgeReport { wallets, entries })
    }
}
