//! # Wallet Pool
//!
//! Hands out exclusive, time-bounded leases on signing wallets. Each wallet
//! sits behind its own lock, so acquire and release on different wallets never
//! contend. Selection is least-recently-released first, ties broken by address.

use crate::error::PoolError;
use crate::model::{Lease, SigningKeyRef, Wallet, WalletRecord, WalletState};
use crate::store::Store;
use crate::utils::lanes::LaneMap;
use crate::utils::logger::ALERT_TARGET;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A granted lease. Carries no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletLease {
    pub address: String,
    pub owner_request_id: String,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl WalletLease {
    fn from_wallet(wallet: &Wallet) -> Option<Self> {
        let lease = wallet.lease.as_ref()?;
        Some(Self {
            address: wallet.address.clone(),
            owner_request_id: lease.owner_request_id.clone(),
            leased_at: lease.leased_at,
            expires_at: lease.expires_at,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub free: usize,
    pub leased: usize,
    pub retired: usize,
    /// Leased share of usable wallets, in percent
    pub utilization: f64,
}

pub struct WalletPool {
    wallets: LaneMap<Wallet>,
    released: Notify,
    lease_ttl: Duration,
    store: Arc<dyn Store>,
}

impl WalletPool {
    pub fn new(store: Arc<dyn Store>, lease_ttl: Duration) -> Self {
        Self {
            wallets: LaneMap::new(),
            released: Notify::new(),
            lease_ttl,
            store,
        }
    }

    /// Loads persisted wallets, replacing any in-memory copy.
    pub(crate) async fn restore(&self, records: &[WalletRecord]) {
        for record in records {
            let lane = self
                .wallets
                .get_or_insert_with(&record.wallet.address, || record.wallet.clone())
                .await;
            *lane.lock().await = record.wallet.clone();
        }
        info!("Wallet pool restored with {} wallets", records.len());
    }

    /// Adds a new `free` wallet to the pool.
    pub async fn provision(
        &self,
        address: &str,
        signing_key_ref: SigningKeyRef,
    ) -> Result<(), PoolError> {
        if self.wallets.get(address).await.is_some() {
            return Err(PoolError::DuplicateWallet {
                address: address.to_string(),
            });
        }
        let wallet = Wallet::new(address, signing_key_ref);
        self.store.save_wallet(&wallet).await?;
        if !self.wallets.insert(address, wallet).await {
            return Err(PoolError::DuplicateWallet {
                address: address.to_string(),
            });
        }
        info!(wallet = %address, "Provisioned wallet");
        Ok(())
    }

    /// Leases one `free` wallet to `owner_request_id`, or reports exhaustion.
    pub async fn acquire(&self, owner_request_id: &str) -> Result<WalletLease, PoolError> {
        self.acquire_excluding(owner_request_id, &HashSet::new())
            .await
    }

    /// Like [`acquire`](Self::acquire) but never picks an address in `exclude`.
    pub async fn acquire_excluding(
        &self,
        owner_request_id: &str,
        exclude: &HashSet<String>,
    ) -> Result<WalletLease, PoolError> {
        let lanes = self.wallets.snapshot().await;

        let mut candidates = Vec::new();
        for (address, lane) in &lanes {
            if exclude.contains(address) {
                continue;
            }
            let wallet = lane.lock().await;
            if wallet.state == WalletState::Free {
                candidates.push((wallet.last_released_at, address.clone(), Arc::clone(lane)));
            }
        }
        // Never-released wallets first, then oldest release
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        for (_, address, lane) in candidates {
            let mut wallet = lane.lock().await;
            // Lost the race to another acquirer
            if wallet.state != WalletState::Free {
                continue;
            }

            let now = Utc::now();
            let ttl = chrono::Duration::from_std(self.lease_ttl)
                .unwrap_or_else(|_| chrono::Duration::days(365));
            let mut updated = wallet.clone();
            updated.state = WalletState::Leased;
            updated.lease = Some(Lease {
                owner_request_id: owner_request_id.to_string(),
                leased_at: now,
                expires_at: now + ttl,
            });

            self.store.save_wallet(&updated).await?;
            *wallet = updated;

            debug!(wallet = %address, request_id = %owner_request_id, "Wallet leased");
            return WalletLease::from_wallet(&wallet).ok_or_else(|| PoolError::InvalidState {
                address,
                state: WalletState::Leased,
                reason: "lease missing after acquire".to_string(),
            });
        }

        let stats = self.stats().await;
        Err(PoolError::PoolExhausted {
            total: stats.total,
            leased: stats.leased,
            retired: stats.retired,
        })
    }

    /// Waits up to `wait` for a release before reporting exhaustion.
    pub async fn acquire_with_wait(
        &self,
        owner_request_id: &str,
        exclude: &HashSet<String>,
        wait: Duration,
    ) -> Result<WalletLease, PoolError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.acquire_excluding(owner_request_id, exclude).await {
                Err(PoolError::PoolExhausted { .. }) if Instant::now() < deadline => {}
                other => return other,
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.acquire_excluding(owner_request_id, exclude).await;
            }
        }
    }

    /// `leased → free`. Only the registration flow holding the lease may release.
    pub async fn release(&self, address: &str, owner_request_id: &str) -> Result<(), PoolError> {
        let lane = self.lane(address).await?;
        let mut wallet = lane.lock().await;

        let held_by = wallet.lease.as_ref().map(|l| l.owner_request_id.as_str());
        if wallet.state != WalletState::Leased || held_by != Some(owner_request_id) {
            return Err(PoolError::InvalidState {
                address: address.to_string(),
                state: wallet.state,
                reason: match held_by {
                    Some(other) => format!("leased by {}, not {}", other, owner_request_id),
                    None => format!("not leased by {}", owner_request_id),
                },
            });
        }

        self.free(address, owner_request_id, &mut wallet).await
    }

    /// Like [`release`](Self::release), but a lease that is already gone or
    /// held by someone else is `Ok(false)` rather than an error. The ownership
    /// check and the release share one lane lock.
    pub async fn release_held(
        &self,
        address: &str,
        owner_request_id: &str,
    ) -> Result<bool, PoolError> {
        let lane = self.lane(address).await?;
        let mut wallet = lane.lock().await;

        let held = wallet.state == WalletState::Leased
            && wallet
                .lease
                .as_ref()
                .is_some_and(|l| l.owner_request_id == owner_request_id);
        if !held {
            debug!(wallet = %address, request_id = %owner_request_id, "Lease already released");
            return Ok(false);
        }

        self.free(address, owner_request_id, &mut wallet).await?;
        Ok(true)
    }

    async fn free(
        &self,
        address: &str,
        owner_request_id: &str,
        wallet: &mut Wallet,
    ) -> Result<(), PoolError> {
        let mut updated = wallet.clone();
        updated.state = WalletState::Free;
        updated.lease = None;
        updated.last_released_at = Some(Utc::now());

        self.store.save_wallet(&updated).await?;
        *wallet = updated;

        self.released.notify_waiters();
        debug!(wallet = %address, request_id = %owner_request_id, "Wallet released");
        Ok(())
    }

    /// `leased|free → retired`. The wallet is never leased again.
    pub async fn retire(&self, address: &str, reason: &str) -> Result<(), PoolError> {
        let lane = self.lane(address).await?;
        let mut wallet = lane.lock().await;

        if wallet.state == WalletState::Retired {
            return Err(PoolError::InvalidState {
                address: address.to_string(),
                state: wallet.state,
                reason: "already retired".to_string(),
            });
        }

        let mut updated = wallet.clone();
        updated.state = WalletState::Retired;
        updated.lease = None;
        updated.retired_reason = Some(reason.to_string());

        self.store.save_wallet(&updated).await?;
        *wallet = updated;

        warn!(target: ALERT_TARGET, wallet = %address, reason = %reason, "Wallet RETIRED");
        Ok(())
    }

    async fn lane(&self, address: &str) -> Result<Arc<tokio::sync::Mutex<Wallet>>, PoolError> {
        self.wallets
            .get(address)
            .await
            .ok_or_else(|| PoolError::UnknownWallet {
                address: address.to_string(),
            })
    }

    /// Key reference for the chain adapter. Retired wallets have none.
    pub(crate) async fn signing_key(&self, address: &str) -> Result<SigningKeyRef, PoolError> {
        let lane = self.lane(address).await?;
        let wallet = lane.lock().await;
        if wallet.state == WalletState::Retired {
            return Err(PoolError::WalletRetired {
                address: address.to_string(),
                reason: wallet.retired_reason.clone().unwrap_or_default(),
            });
        }
        Ok(wallet.signing_key_ref.clone())
    }

    pub async fn state_of(&self, address: &str) -> Option<WalletState> {
        let lane = self.wallets.get(address).await?;
        let wallet = lane.lock().await;
        Some(wallet.state)
    }

    pub async fn lease_of(&self, address: &str) -> Option<WalletLease> {
        let lane = self.wallets.get(address).await?;
        let wallet = lane.lock().await;
        WalletLease::from_wallet(&wallet)
    }

    pub async fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for (_, lane) in self.wallets.snapshot().await {
            let wallet = lane.lock().await;
            stats.total += 1;
            match wallet.state {
                WalletState::Free => stats.free += 1,
                WalletState::Leased => stats.leased += 1,
                WalletState::Retired => stats.retired += 1,
            }
        }
        let usable = stats.free + stats.leased;
        if usable > 0 {
            stats.utilization = stats.leased as f64 / usable as f64 * 100.0;
        }
        stats
    }

    /// Current assignments, oldest first.
    pub async fn active_leases(&self) -> Vec<WalletLease> {
        let mut leases = Vec::new();
        for (_, lane) in self.wallets.snapshot().await {
            let wallet = lane.lock().await;
            if let Some(lease) = WalletLease::from_wallet(&wallet) {
                leases.push(lease);
            }
        }
        leases.sort_by(|a, b| a.leased_at.cmp(&b.leased_at));
        leases
    }

    pub async fn expired_leases(&self, now: DateTime<Utc>) -> Vec<WalletLease> {
        self.active_leases()
            .await
            .into_iter()
            .filter(|l| l.expires_at <= now)
            .collect()
    }

    pub async fn clear(&self) {
        self.wallets.clear().await;
    }
}
