//! Shogun Relay ledger
//!
//! Typed key-value projection over the replicated graph substrate. The
//! substrate only guarantees per-key last-writer-wins and possibly stale
//! reads; counters kept here are advisory and repaired by the scheduler's
//! reconciliation task.

pub mod error;
pub mod projection;
pub mod records;
pub mod substrate;

pub use error::{LedgerError, Result};
pub use projection::{keys, Ledger};
pub use records::{ApiKeyRecord, Deal, DealStatus, PublicLink, Pulse, Subscription, Upload};
pub use substrate::{Entry, MemorySubstrate, SledSubstrate, Substrate};
