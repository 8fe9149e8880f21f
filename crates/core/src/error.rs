//! Caller-facing error model.

use thiserror::Error;

use crate::id::ProductId;

/// Result type used across the ledger.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Error returned to callers of the ledger API.
///
/// Business rejections (`ProductNotFound`, `InsufficientStock`,
/// `InvalidRequest`) are deterministic and never retried. Transient storage
/// contention is retried internally and only surfaces as
/// `ConcurrencyExhausted` once the retry budget is spent.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Referenced product does not exist or is inactive.
    #[error("product {0} not found or inactive")]
    ProductNotFound(ProductId),

    /// The movement would drive the quantity on hand below zero.
    ///
    /// Carries the current quantity so callers can display it.
    #[error("insufficient stock: {current} on hand, {requested} requested")]
    InsufficientStock { current: i64, requested: i64 },

    /// Rejected before any lock is taken (zero quantity, malformed
    /// idempotency key, empty actor, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Transient storage contention persisted through every retry attempt.
    #[error("contention not resolved after {attempts} attempts: {last}")]
    ConcurrencyExhausted { attempts: u32, last: String },

    /// Non-retryable storage failure.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// True for deterministic business rejections that callers should not retry.
    pub fn is_business_rejection(&self) -> bool {
        matches!(
            self,
            Self::ProductNotFound(_) | Self::InsufficientStock { .. } | Self::InvalidRequest(_)
        )
    }
}
