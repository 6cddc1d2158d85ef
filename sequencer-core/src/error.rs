//! # Core Error Types
//!
//! Centralized error definitions for the sequencer core.
//! Each component owns a typed error; [`CoreError`] unifies them for the
//! pipeline layer, and [`RegistrationError`] is the only shape that crosses the
//! registration boundary.

use crate::model::{EntryStatus, WalletState};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Unified error type for pipeline operations.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Config(ConfigError),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error(transparent)]
    Pool(PoolError),

    #[error(transparent)]
    Nonce(NonceError),

    #[error(transparent)]
    Queue(QueueError),

    #[error(transparent)]
    Chain(ChainError),
}

impl CoreError {
    /// Structural invariant violations. These are never retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            CoreError::Nonce(e) | CoreError::Queue(QueueError::Nonce(e)) => e.is_violation(),
            _ => false,
        }
    }
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        CoreError::Config(e)
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        CoreError::Store(e)
    }
}

impl From<PoolError> for CoreError {
    fn from(e: PoolError) -> Self {
        CoreError::Pool(e)
    }
}

impl From<NonceError> for CoreError {
    fn from(e: NonceError) -> Self {
        CoreError::Nonce(e)
    }
}

impl From<QueueError> for CoreError {
    fn from(e: QueueError) -> Self {
        CoreError::Queue(e)
    }
}

impl From<ChainError> for CoreError {
    fn from(e: ChainError) -> Self {
        CoreError::Chain(e)
    }
}

/// Configuration-related errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Missing required configuration field: '{field}'")]
    MissingField { field: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("I/O error reading {path}: {msg}")]
    IoError { path: String, msg: String },

    #[error("Failed to parse {path}: {msg}")]
    Parse { path: String, msg: String },
}

/// Persistence errors
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Database operation '{op}' failed: {msg}")]
    Database { op: &'static str, msg: String },

    #[error("Corrupt {table} row '{key}': {reason}")]
    Corrupt {
        table: &'static str,
        key: String,
        reason: String,
    },
}

/// Wallet pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Wallet pool exhausted: {leased} leased, {retired} retired of {total}")]
    PoolExhausted {
        total: usize,
        leased: usize,
        retired: usize,
    },

    #[error("Wallet {address} is {state}: {reason}")]
    InvalidState {
        address: String,
        state: WalletState,
        reason: String,
    },

    #[error("Unknown wallet {address}")]
    UnknownWallet { address: String },

    #[error("Wallet {address} already provisioned")]
    DuplicateWallet { address: String },

    #[error("Wallet {address} retired: {reason}")]
    WalletRetired { address: String, reason: String },

    #[error("Pool persistence failed: {0}")]
    Store(String),
}

impl From<StoreError> for PoolError {
    fn from(e: StoreError) -> Self {
        PoolError::Store(e.to_string())
    }
}

/// Nonce sequencing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NonceError {
    #[error("Nonce conflict on {address} at nonce {nonce}: {reason}")]
    NonceConflict {
        address: String,
        nonce: u64,
        reason: String,
    },

    #[error("Nonce gap on {address}: expected {expected} to confirm next, got {confirmed}")]
    NonceGap {
        address: String,
        expected: u64,
        confirmed: u64,
    },

    #[error("Nonce persistence failed: {0}")]
    Store(String),
}

impl NonceError {
    /// Ordering violations, as opposed to a failed write.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            NonceError::NonceConflict { .. } | NonceError::NonceGap { .. }
        )
    }
}

impl From<StoreError> for NonceError {
    fn from(e: StoreError) -> Self {
        NonceError::Store(e.to_string())
    }
}

/// Transaction queue errors
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Queue entry {entry_id} not found")]
    NotFound { entry_id: String },

    #[error("Queue entry {entry_id} cannot {event} from {from}")]
    InvalidTransition {
        entry_id: String,
        from: EntryStatus,
        event: &'static str,
    },

    #[error("Queue entry {entry_id} is confirmed and immutable")]
    Immutable { entry_id: String },

    #[error("Queue entry {entry_id} already resolved as {status}")]
    NotCancellable {
        entry_id: String,
        status: EntryStatus,
    },

    #[error(transparent)]
    Nonce(#[from] NonceError),

    #[error("Queue persistence failed: {0}")]
    Store(#[from] StoreError),
}

/// Why the chain refused a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    Underpriced,
    Malformed,
    NonceTooLow,
    InsufficientFunds,
    SigningFailed,
    Other,
}

impl RejectionKind {
    /// Rejections that say something about the wallet rather than the network.
    pub fn is_wallet_specific(&self) -> bool {
        matches!(
            self,
            RejectionKind::InsufficientFunds | RejectionKind::SigningFailed
        )
    }
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectionKind::Underpriced => "underpriced",
            RejectionKind::Malformed => "malformed",
            RejectionKind::NonceTooLow => "nonce too low",
            RejectionKind::InsufficientFunds => "insufficient funds",
            RejectionKind::SigningFailed => "signing failed",
            RejectionKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Chain interface errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Submission rejected ({kind}): {reason}")]
    SubmissionRejected { kind: RejectionKind, reason: String },

    #[error("No acceptance within {timeout_ms}ms")]
    AcceptanceTimeout { timeout_ms: u64 },

    #[error("No confirmation within {timeout_ms}ms")]
    ConfirmationTimeout { timeout_ms: u64 },

    #[error("Chain transport error: {reason}")]
    Transport { reason: String },
}

/// User-visible failure reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    AttemptsExhausted,
    WalletRetired,
    Cancelled,
    LeaseExpired,
    Internal,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::AttemptsExhausted => "attempts_exhausted",
            FailureCode::WalletRetired => "wallet_retired",
            FailureCode::Cancelled => "cancelled",
            FailureCode::LeaseExpired => "lease_expired",
            FailureCode::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "attempts_exhausted" => Some(FailureCode::AttemptsExhausted),
            "wallet_retired" => Some(FailureCode::WalletRetired),
            "cancelled" => Some(FailureCode::Cancelled),
            "lease_expired" => Some(FailureCode::LeaseExpired),
            "internal" => Some(FailureCode::Internal),
            _ => None,
        }
    }

    /// Explanation shown to registration callers
    pub fn explanation(&self) -> &'static str {
        match self {
            FailureCode::AttemptsExhausted => {
                "registration transaction could not be confirmed after repeated attempts"
            }
            FailureCode::WalletRetired => "assigned signing wallet became unusable",
            FailureCode::Cancelled => "registration was cancelled before submission",
            FailureCode::LeaseExpired => "wallet lease expired before the registration resolved",
            FailureCode::Internal => "internal sequencing error",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced to the registration service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("No wallet available, retry later ({leased} of {total} leased)")]
    PoolExhausted { total: usize, leased: usize },

    #[error("Registration {owner_request_id} pending on wallet {wallet_address}")]
    Pending {
        owner_request_id: String,
        wallet_address: String,
    },

    #[error("Registration {owner_request_id} failed [{code}]: {}", .code.explanation())]
    Failure {
        owner_request_id: String,
        code: FailureCode,
    },

    #[error("No registration known for {owner_request_id}")]
    UnknownRequest { owner_request_id: String },
}
