//! # Chain Interface
//!
//! The opaque boundary to the registration contract. The core only needs to
//! submit a signed transaction, read an account's transaction count and poll a
//! submitted transaction for its fate.

mod simulated;

pub use simulated::{SimulatedChain, SubmissionRecord, SubmitBehavior, WatchBehavior};

use crate::error::ChainError;
use crate::model::{SigningKeyRef, TxPayload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Proof that the chain accepted a transaction into its pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceptanceReceipt {
    pub tx_hash: String,
    pub wallet_address: String,
    pub nonce: u64,
    pub accepted_at: DateTime<Utc>,
}

/// Result of one confirmation poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationStatus {
    /// Not final yet; `depth` blocks so far (0 when still unmined)
    Pending { depth: u32 },
    Confirmed { depth: u32 },
    /// Mined, then removed by a reorganization
    Reorged,
    /// Evicted from the pool without being mined
    Dropped,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Signs and broadcasts. Returns once the chain accepts or rejects it.
    async fn submit(
        &self,
        wallet_address: &str,
        signing_key_ref: &SigningKeyRef,
        nonce: u64,
        payload: &TxPayload,
    ) -> Result<AcceptanceReceipt, ChainError>;

    /// Transaction count of the account, i.e. the next usable nonce.
    async fn account_nonce(&self, wallet_address: &str) -> Result<u64, ChainError>;

    async fn watch_confirmation(
        &self,
        receipt: &AcceptanceReceipt,
    ) -> Result<ConfirmationStatus, ChainError>;
}
