use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use stockledger_catalog::{NewMovement, NewProduct, Product, StockMovement};
use stockledger_core::ProductId;

/// Storage operation error.
///
/// These are infrastructure-level outcomes; the ledger core maps them onto
/// the caller-facing `LedgerError` taxonomy. The split that matters here is
/// transient vs. deterministic: only transient errors are retried by the
/// concurrency controller.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("product not found")]
    ProductNotFound,

    #[error("product is inactive")]
    ProductInactive,

    /// The movement would drive the quantity below zero. Carries the
    /// quantity read under the exclusive lock.
    #[error("insufficient stock: {current} on hand")]
    InsufficientStock { current: i64 },

    /// Another writer committed the same idempotency key first.
    #[error("idempotency key already recorded")]
    IdempotencyConflict,

    /// Catalog code uniqueness violated.
    #[error("product code already registered: {0}")]
    DuplicateCode(String),

    /// Soft-delete guard: products with stock on hand stay active.
    #[error("product still has {current} units on hand")]
    ProductHasStock { current: i64 },

    /// Serialization failure or deadlock; resolves on retry.
    #[error("serialization conflict: {0}")]
    Serialization(String),

    /// Lock-wait or pool-acquire timeout; resolves on retry.
    #[error("lock wait timeout: {0}")]
    LockTimeout(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Transient failures are retried by the concurrency controller;
    /// everything else propagates immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Serialization(_) | Self::LockTimeout(_))
    }
}

/// Data access for the product catalog and the movement log.
///
/// Implementations must provide, for `apply_movement`:
/// - an exclusive per-product lock for the read-validate-write sequence
///   (writers to other products proceed in parallel);
/// - atomicity: the movement insert and the catalog update commit together
///   or not at all;
/// - monotonically increasing movement IDs in commit order;
/// - a uniqueness guarantee on `idempotency_key` so a racing duplicate
///   surfaces as `IdempotencyConflict` instead of a second row.
///
/// Reads (`product`, `movements`, `products_below_threshold`) never take the
/// product lock.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Register a product in the catalog.
    async fn insert_product(&self, product: NewProduct) -> Result<Product, StoreError>;

    /// Fetch one product (active or not).
    async fn product(&self, id: ProductId) -> Result<Option<Product>, StoreError>;

    /// All active products, for the auditor's sweep.
    async fn active_products(&self) -> Result<Vec<Product>, StoreError>;

    /// Active products at or below their reorder threshold, optionally
    /// restricted to one warehouse.
    async fn products_below_threshold(
        &self,
        warehouse: Option<&str>,
    ) -> Result<Vec<Product>, StoreError>;

    /// Full movement history of a product, in creation order.
    async fn movements(&self, product_id: ProductId) -> Result<Vec<StockMovement>, StoreError>;

    /// Look up an already-recorded movement by idempotency key.
    async fn find_by_idempotency_key(
        &self,
        key: Uuid,
    ) -> Result<Option<StockMovement>, StoreError>;

    /// The atomic unit: lock the product row, re-read its quantity, validate
    /// the delta, insert the movement and update the catalog in one
    /// transaction.
    async fn apply_movement(&self, movement: NewMovement) -> Result<StockMovement, StoreError>;

    /// Soft-delete: mark a product inactive. Rejected while stock remains.
    async fn deactivate_product(&self, id: ProductId) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn insert_product(&self, product: NewProduct) -> Result<Product, StoreError> {
        (**self).insert_product(product).await
    }

    async fn product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        (**self).product(id).await
    }

    async fn active_products(&self) -> Result<Vec<Product>, StoreError> {
        (**self).active_products().await
    }

    async fn products_below_threshold(
        &self,
        warehouse: Option<&str>,
    ) -> Result<Vec<Product>, StoreError> {
        (**self).products_below_threshold(warehouse).await
    }

    async fn movements(&self, product_id: ProductId) -> Result<Vec<StockMovement>, StoreError> {
        (**self).movements(product_id).await
    }

    async fn find_by_idempotency_key(
        &self,
        key: Uuid,
    ) -> Result<Option<StockMovement>, StoreError> {
        (**self).find_by_idempotency_key(key).await
    }

    async fn apply_movement(&self, movement: NewMovement) -> Result<StockMovement, StoreError> {
        (**self).apply_movement(movement).await
    }

    async fn deactivate_product(&self, id: ProductId) -> Result<(), StoreError> {
        (**self).deactivate_product(id).await
    }
}
