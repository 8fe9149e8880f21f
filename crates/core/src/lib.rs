//! Foundation types for the stock ledger.
//!
//! This crate contains **pure** primitives shared by every layer: strongly
//! typed identifiers and the caller-facing error taxonomy. No IO here.

pub mod error;
pub mod id;

pub use error::{LedgerError, LedgerResult};
pub use id::{MovementId, ProductId};
