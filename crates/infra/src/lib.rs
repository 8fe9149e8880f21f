//! Infrastructure layer: storage adapters, the concurrency controller, the
//! ledger core and the consistency auditor.

pub mod auditor;
pub mod ledger;
pub mod retry;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use auditor::{ConsistencyAuditor, ConsistencyReport, DriftEntry};
pub use ledger::StockLedger;
pub use retry::{RetryError, RetryPolicy};
pub use store::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore, StoreError};
