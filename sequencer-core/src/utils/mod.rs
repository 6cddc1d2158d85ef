//! # Utilities Module
//!
//! Internal helpers for the sequencer pipeline. The crate root re-exports the
//! pieces that belong to the public API.

pub(crate) mod inventory;
pub(crate) mod lanes;
pub(crate) mod logger;
pub(crate) mod retry;
