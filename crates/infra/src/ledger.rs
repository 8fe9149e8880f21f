//! Ledger core: the single writer for catalog quantities and the movement
//! log.
//!
//! Every mutation funnels through [`StockLedger::record_movement`], which
//! validates the request before any lock is taken, hands the atomic
//! read-validate-write unit to the store, and absorbs transient contention
//! with the retry policy. Reads never lock.

use stockledger_catalog::{
    MovementRequest, MovementResult, NewMovement, NewProduct, Product, ProductAlert,
};
use stockledger_core::{LedgerError, LedgerResult, ProductId};

use crate::retry::{RetryError, RetryPolicy};
use crate::store::{LedgerStore, StoreError};

/// The ledger core.
///
/// Generic over the store so tests run against [`crate::InMemoryLedgerStore`]
/// and production against [`crate::PostgresLedgerStore`] (or an
/// `Arc<dyn LedgerStore>` chosen at wiring time).
#[derive(Debug)]
pub struct StockLedger<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S: LedgerStore> StockLedger<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(store: S, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Direct read access for collaborators that only read (the auditor).
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Record one stock movement.
    ///
    /// Idempotent when the request carries an idempotency key: a repeat
    /// returns the originally stored result without re-applying the delta.
    /// Transient storage conflicts are retried with backoff; business
    /// rejections propagate immediately.
    pub async fn record_movement(&self, request: MovementRequest) -> LedgerResult<MovementResult> {
        let movement = request.validate()?;

        if let Some(key) = movement.idempotency_key {
            if let Some(existing) = self
                .store
                .find_by_idempotency_key(key)
                .await
                .map_err(|e| LedgerError::storage(e.to_string()))?
            {
                tracing::debug!(%key, movement_id = %existing.id, "idempotent replay");
                return Ok(existing.result());
            }
        }

        let outcome = self
            .retry
            .run(StoreError::is_transient, |attempt| {
                let movement = movement.clone();
                async move {
                    if attempt > 0 {
                        tracing::warn!(
                            attempt,
                            product_id = %movement.product_id,
                            "retrying movement after transient conflict"
                        );
                    }
                    self.store.apply_movement(movement).await
                }
            })
            .await;

        match outcome {
            Ok(committed) => {
                tracing::info!(
                    movement_id = %committed.id,
                    product_id = %committed.product_id,
                    kind = %committed.kind,
                    delta = committed.delta,
                    quantity_after = committed.quantity_after,
                    "movement recorded"
                );
                Ok(committed.result())
            }
            // Lost the insert race on the idempotency key: the winner's
            // movement is this request's result.
            Err(RetryError::Fatal(StoreError::IdempotencyConflict)) => {
                self.replay_idempotent(&movement).await
            }
            Err(RetryError::Fatal(err)) => Err(map_store_error(err, &movement)),
            Err(RetryError::Exhausted { attempts, last }) => {
                tracing::error!(attempts, error = %last, "contention retries exhausted");
                Err(LedgerError::ConcurrencyExhausted {
                    attempts,
                    last: last.to_string(),
                })
            }
        }
    }

    /// Current quantity on hand; `ProductNotFound` when the ID is unknown.
    pub async fn quantity_on_hand(&self, id: ProductId) -> LedgerResult<i64> {
        let product = self
            .store
            .product(id)
            .await
            .map_err(|e| LedgerError::storage(e.to_string()))?
            .ok_or(LedgerError::ProductNotFound(id))?;
        Ok(product.quantity_on_hand)
    }

    /// Active products at or below their reorder threshold, most urgent
    /// first: out-of-stock, then critical, then low; ascending quantity
    /// within each tier. Lock-free read.
    pub async fn list_critical_stock(
        &self,
        warehouse: Option<&str>,
    ) -> LedgerResult<Vec<ProductAlert>> {
        let products = self
            .store
            .products_below_threshold(warehouse)
            .await
            .map_err(|e| LedgerError::storage(e.to_string()))?;

        let mut alerts: Vec<ProductAlert> = products
            .iter()
            .filter_map(ProductAlert::for_product)
            .collect();
        alerts.sort_by(|a, b| {
            a.tier
                .cmp(&b.tier)
                .then(a.quantity_on_hand.cmp(&b.quantity_on_hand))
        });
        Ok(alerts)
    }

    /// Catalog hook: register a product (starts at zero quantity, active).
    pub async fn create_product(&self, product: NewProduct) -> LedgerResult<Product> {
        product.validate()?;
        self.store.insert_product(product).await.map_err(|e| match e {
            StoreError::DuplicateCode(code) => {
                LedgerError::invalid_request(format!("code already registered: {code}"))
            }
            other => LedgerError::storage(other.to_string()),
        })
    }

    /// Catalog hook: soft-delete. Only allowed once the shelf is empty.
    pub async fn deactivate_product(&self, id: ProductId) -> LedgerResult<()> {
        self.store.deactivate_product(id).await.map_err(|e| match e {
            StoreError::ProductNotFound => LedgerError::ProductNotFound(id),
            StoreError::ProductHasStock { current } => LedgerError::invalid_request(format!(
                "cannot deactivate product with {current} units on hand"
            )),
            other => LedgerError::storage(other.to_string()),
        })
    }

    async fn replay_idempotent(&self, movement: &NewMovement) -> LedgerResult<MovementResult> {
        let Some(key) = movement.idempotency_key else {
            // A key-less movement cannot conflict on the idempotency index.
            return Err(LedgerError::storage(
                "idempotency conflict without idempotency key",
            ));
        };
        let existing = self
            .store
            .find_by_idempotency_key(key)
            .await
            .map_err(|e| LedgerError::storage(e.to_string()))?
            .ok_or_else(|| {
                LedgerError::storage("idempotency conflict but stored movement not found")
            })?;
        tracing::debug!(%key, movement_id = %existing.id, "idempotent replay after insert race");
        Ok(existing.result())
    }
}

fn map_store_error(err: StoreError, movement: &NewMovement) -> LedgerError {
    match err {
        StoreError::ProductNotFound | StoreError::ProductInactive => {
            LedgerError::ProductNotFound(movement.product_id)
        }
        StoreError::InsufficientStock { current } => LedgerError::InsufficientStock {
            current,
            requested: movement.delta.abs(),
        },
        StoreError::IdempotencyConflict => {
            // Handled by the caller before reaching here.
            LedgerError::storage("unresolved idempotency conflict")
        }
        StoreError::DuplicateCode(code) => {
            LedgerError::invalid_request(format!("code already registered: {code}"))
        }
        StoreError::ProductHasStock { current } => {
            LedgerError::invalid_request(format!("product still has {current} units on hand"))
        }
        transient @ (StoreError::Serialization(_) | StoreError::LockTimeout(_)) => {
            // Transient errors are routed through the retry wrapper; reaching
            // here means the classifier and this mapping disagree.
            LedgerError::storage(transient.to_string())
        }
        StoreError::Backend(msg) => LedgerError::storage(msg),
    }
}
