//! # Data Model
//!
//! Wallets, queue entries and registration outcome records, plus the entry
//! state machine that every queue transition goes through.

use crate::error::FailureCode;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub type EntryId = String;

/// Lifecycle state of a pooled wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletState {
    Free,
    Leased,
    Retired,
}

impl WalletState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletState::Free => "free",
            WalletState::Leased => "leased",
            WalletState::Retired => "retired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(WalletState::Free),
            "leased" => Some(WalletState::Leased),
            "retired" => Some(WalletState::Retired),
            _ => None,
        }
    }
}

impl fmt::Display for WalletState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque reference to signing key material.
///
/// Never printed: `Debug` is redacted and the inner value is wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SigningKeyRef(String);

impl SigningKeyRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Raw reference, for the chain adapter and the store only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SigningKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKeyRef(***REDACTED***)")
    }
}

/// Exclusive, time-bounded ownership of a wallet by one registration flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub owner_request_id: String,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct Wallet {
    pub address: String,
    pub signing_key_ref: SigningKeyRef,
    pub state: WalletState,
    pub lease: Option<Lease>,
    pub last_released_at: Option<DateTime<Utc>>,
    pub retired_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(address: impl Into<String>, signing_key_ref: SigningKeyRef) -> Self {
        Self {
            address: address.into(),
            signing_key_ref,
            state: WalletState::Free,
            lease: None,
            last_released_at: None,
            retired_reason: None,
            created_at: Utc::now(),
        }
    }
}

/// Wallet row as persisted, including the sequencer's nonce column
#[derive(Debug, Clone)]
pub struct WalletRecord {
    pub wallet: Wallet,
    pub last_known_nonce: Option<u64>,
}

/// Opaque transaction data handed to the chain interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxPayload {
    pub kind: String,
    pub body: serde_json::Value,
    /// Fee multiplier in basis points; 10_000 is the base fee
    pub fee_multiplier_bps: u32,
}

impl TxPayload {
    pub const BASE_FEE_BPS: u32 = 10_000;

    pub fn registration(body: serde_json::Value) -> Self {
        Self {
            kind: "registration".to_string(),
            body,
            fee_multiplier_bps: Self::BASE_FEE_BPS,
        }
    }

    /// Replacement payload with a raised fee, for underpriced rejections
    pub fn with_fee_bump(&self, bump_bps: u32) -> Self {
        Self {
            fee_multiplier_bps: self.fee_multiplier_bps.saturating_add(bump_bps),
            ..self.clone()
        }
    }
}

/// Queue entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Queued,
    Submitted,
    /// Queued again behind a backoff deadline
    Retrying,
    Confirmed,
    Failed,
}

/// Events that drive [`EntryStatus`] transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryEvent {
    /// Dequeued for submission
    Dispatch,
    /// Sent back to the queue, optionally behind a backoff
    Requeue { delayed: bool },
    Confirm,
    Fail,
}

impl EntryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EntryEvent::Dispatch => "dispatch",
            EntryEvent::Requeue { .. } => "requeue",
            EntryEvent::Confirm => "confirm",
            EntryEvent::Fail => "fail",
        }
    }
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Queued => "queued",
            EntryStatus::Submitted => "submitted",
            EntryStatus::Retrying => "retrying",
            EntryStatus::Confirmed => "confirmed",
            EntryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(EntryStatus::Queued),
            "submitted" => Some(EntryStatus::Submitted),
            "retrying" => Some(EntryStatus::Retrying),
            "confirmed" => Some(EntryStatus::Confirmed),
            "failed" => Some(EntryStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Confirmed | EntryStatus::Failed)
    }

    /// Waiting for dispatch, possibly behind a backoff
    pub fn is_waiting(&self) -> bool {
        matches!(self, EntryStatus::Queued | EntryStatus::Retrying)
    }

    /// Next status for `event`, or `None` if the transition is not allowed.
    pub fn apply(self, event: EntryEvent) -> Option<EntryStatus> {
        use EntryStatus::*;
        match (self, event) {
            (Queued | Retrying, EntryEvent::Dispatch) => Some(Submitted),
            (Submitted | Failed, EntryEvent::Requeue { delayed: false }) => Some(Queued),
            (Submitted | Failed, EntryEvent::Requeue { delayed: true }) => Some(Retrying),
            (Submitted, EntryEvent::Confirm) => Some(Confirmed),
            (Queued | Retrying | Submitted, EntryEvent::Fail) => Some(Failed),
            _ => None,
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending transaction bound to one wallet and one nonce
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub owner_request_id: String,
    pub wallet_address: String,
    pub nonce: u64,
    pub payload: TxPayload,
    pub status: EntryStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Set once the entry confirms
    pub tx_hash: Option<String>,
    /// Hashes the chain accepted for the current nonce, oldest first
    pub accepted_hashes: Vec<String>,
    /// Backoff deadline while `Retrying`
    pub not_before: Option<DateTime<Utc>>,
    /// Cancelled after submission; resolves without further retries
    pub abandoned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(
        owner_request_id: &str,
        wallet_address: &str,
        nonce: u64,
        payload: TxPayload,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: generate_entry_id(),
            owner_request_id: owner_request_id.to_string(),
            wallet_address: wallet_address.to_string(),
            nonce,
            payload,
            status: EntryStatus::Queued,
            attempts: 0,
            last_error: None,
            tx_hash: None,
            accepted_hashes: Vec::new(),
            not_before: None,
            abandoned: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the entry may be dispatched at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            EntryStatus::Queued => true,
            EntryStatus::Retrying => self.not_before.map_or(true, |at| at <= now),
            _ => false,
        }
    }
}

/// `tx_<millis>_<9 random base36 chars>`
pub fn generate_entry_id() -> EntryId {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("tx_{}_{}", Utc::now().timestamp_millis(), suffix)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Pending,
    Completed,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Pending => "pending",
            OutcomeStatus::Completed => "completed",
            OutcomeStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutcomeStatus::Pending),
            "completed" => Some(OutcomeStatus::Completed),
            "failed" => Some(OutcomeStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OutcomeStatus::Pending)
    }
}

/// Final result of one registration request, keyed by its idempotency key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrationOutcome {
    pub owner_request_id: String,
    pub wallet_address: String,
    pub entry_id: Option<EntryId>,
    pub transaction_hash: Option<String>,
    pub status: OutcomeStatus,
    pub failure: Option<FailureCode>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RegistrationOutcome {
    pub fn pending(owner_request_id: &str, wallet_address: &str) -> Self {
        let now = Utc::now();
        Self {
            owner_request_id: owner_request_id.to_string(),
            wallet_address: wallet_address.to_string(),
            entry_id: None,
            transaction_hash: None,
            status: OutcomeStatus::Pending,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }
}
