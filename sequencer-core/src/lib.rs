//! # Sequencer Core - Wallet Allocation and Transaction Sequencing
//!
//! Leases signing wallets from a finite pool, queues registration
//! transactions under each wallet's next nonce, drives them to the chain and
//! reconciles the chain's verdict back into wallet, queue and outcome state.
//!
//! ## Modules
//!
//! - [`pool`] - Wallet pool with exclusive, time-bounded leases
//! - [`sequencer`] - Per-wallet nonce issuance and chain reconciliation
//! - [`queue`] - Per-wallet transaction queue and entry state machine
//! - [`submitter`] - Sends queued entries to the chain
//! - [`reconciler`] - Confirmation watching, outcome records, wallet release
//! - [`coordinator`] - Registration entry point wiring everything together
//! - [`dispatcher`] - Concurrent per-wallet pipeline loop
//! - [`chain`] - Chain client trait and an in-process simulated chain
//! - [`store`] - SQLite and in-memory persistence
//! - [`config`] - TOML configuration with env overrides
//! - [`error`] - Typed error handling with thiserror
//! - [`metrics`] - Pipeline counters and latency

pub mod chain;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod queue;
pub mod reconciler;
pub mod sequencer;
pub mod store;
pub mod submitter;
pub(crate) mod utils;

pub use chain::{
    AcceptanceReceipt, ChainClient, ConfirmationStatus, SimulatedChain, SubmissionRecord,
    SubmitBehavior, WatchBehavior,
};
pub use config::SequencerConfig;
pub use coordinator::{RegistrationCoordinator, RegistrationReceipt, SequencerStatus};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use error::{
    ChainError, ConfigError, CoreError, FailureCode, NonceError, PoolError, QueueError,
    RegistrationError, RejectionKind, StoreError,
};
pub use metrics::{MetricsSnapshot, SequencerMetrics};
pub use model::{
    EntryStatus, OutcomeStatus, QueueEntry, RegistrationOutcome, SigningKeyRef, TxPayload,
    Wallet, WalletState,
};
pub use pool::{PoolStats, WalletLease, WalletPool};
pub use queue::{CancelOutcome, QueueStatus, TransactionQueue};
pub use reconciler::{OutcomeCounts, Reconciler, Resolution, SweepReport};
pub use sequencer::{NonceSequencer, NonceState};
pub use store::{MemoryStore, PurgeReport, SqliteStore, Store, StoreMetricsSnapshot};
pub use submitter::{StepOutcome, Submitter};

// Utils are pub(crate) - only export specific public utilities
pub use utils::inventory::{load_inventory, parse_inventory, InventoryEntry};
pub use utils::logger::{setup_logger, ALERT_TARGET, OUTCOME_TARGET};
pub use utils::retry::{with_retry, RetryConfig, RetryDecision, RetryPolicy};
