use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use stockledger_catalog::{NewMovement, NewProduct, Product, StockMovement};
use stockledger_core::{MovementId, ProductId};

use super::r#trait::{LedgerStore, StoreError};

/// In-memory catalog + movement log.
///
/// Intended for tests/dev. Mirrors the Postgres semantics: one async mutex
/// per product plays the role of the row lock, so writers to the same
/// product serialize while other products proceed in parallel.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    products: RwLock<HashMap<ProductId, Product>>,
    movements: RwLock<Vec<StockMovement>>,
    idempotency: RwLock<HashMap<Uuid, MovementId>>,
    product_locks: StdMutex<HashMap<ProductId, Arc<AsyncMutex<()>>>>,
    next_product_id: AtomicI64,
    next_movement_id: AtomicI64,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: ProductId) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .product_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(id).or_default().clone()
    }

    fn read_products(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<ProductId, Product>>, StoreError> {
        self.products
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    /// Overwrite the cached quantity without touching the movement log.
    ///
    /// This bypasses the single-writer discipline on purpose: it simulates
    /// the external tampering the consistency auditor exists to detect.
    pub fn set_quantity_unchecked(&self, id: ProductId, quantity: i64) {
        if let Ok(mut products) = self.products.write() {
            if let Some(p) = products.get_mut(&id) {
                p.quantity_on_hand = quantity;
            }
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn insert_product(&self, product: NewProduct) -> Result<Product, StoreError> {
        let mut products = self
            .products
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;

        if products.values().any(|p| p.code == product.code) {
            return Err(StoreError::DuplicateCode(product.code));
        }

        let id = ProductId::new(self.next_product_id.fetch_add(1, Ordering::SeqCst) + 1);
        let row = Product {
            id,
            code: product.code,
            name: product.name,
            quantity_on_hand: 0,
            reorder_threshold: product.reorder_threshold,
            max_threshold: product.max_threshold,
            warehouse: product.warehouse,
            active: true,
        };
        products.insert(id, row.clone());
        Ok(row)
    }

    async fn product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.read_products()?.get(&id).cloned())
    }

    async fn active_products(&self) -> Result<Vec<Product>, StoreError> {
        let mut active: Vec<Product> = self
            .read_products()?
            .values()
            .filter(|p| p.active)
            .cloned()
            .collect();
        active.sort_by_key(|p| p.id);
        Ok(active)
    }

    async fn products_below_threshold(
        &self,
        warehouse: Option<&str>,
    ) -> Result<Vec<Product>, StoreError> {
        let mut hits: Vec<Product> = self
            .read_products()?
            .values()
            .filter(|p| p.active && p.quantity_on_hand <= p.reorder_threshold)
            .filter(|p| match warehouse {
                Some(w) => p.warehouse.as_deref() == Some(w),
                None => true,
            })
            .cloned()
            .collect();
        hits.sort_by_key(|p| p.id);
        Ok(hits)
    }

    async fn movements(&self, product_id: ProductId) -> Result<Vec<StockMovement>, StoreError> {
        let log = self
            .movements
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
        // The log vector is already in commit (= ID) order.
        Ok(log
            .iter()
            .filter(|m| m.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn find_by_idempotency_key(
        &self,
        key: Uuid,
    ) -> Result<Option<StockMovement>, StoreError> {
        let index = self
            .idempotency
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
        let Some(movement_id) = index.get(&key).copied() else {
            return Ok(None);
        };
        let log = self
            .movements
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
        Ok(log.iter().find(|m| m.id == movement_id).cloned())
    }

    async fn apply_movement(&self, movement: NewMovement) -> Result<StockMovement, StoreError> {
        // Exclusive per-product section; the guard spans the whole
        // read-validate-write sequence.
        let row_lock = self.lock_for(movement.product_id);
        let _guard = row_lock.lock().await;

        let quantity_before = {
            let products = self.read_products()?;
            let product = products
                .get(&movement.product_id)
                .ok_or(StoreError::ProductNotFound)?;
            if !product.active {
                return Err(StoreError::ProductInactive);
            }
            product.quantity_on_hand
        };

        let quantity_after = quantity_before
            .checked_add(movement.delta)
            .ok_or_else(|| StoreError::Backend("quantity overflow".to_string()))?;
        if quantity_after < 0 {
            return Err(StoreError::InsufficientStock {
                current: quantity_before,
            });
        }

        let id = MovementId::new(self.next_movement_id.fetch_add(1, Ordering::SeqCst) + 1);

        // Check-and-reserve in one critical section: the row lock does not
        // serialize writers targeting different products, only the index's
        // own lock keeps a key unique across the whole log.
        if let Some(key) = movement.idempotency_key {
            let mut index = self
                .idempotency
                .write()
                .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
            if index.contains_key(&key) {
                return Err(StoreError::IdempotencyConflict);
            }
            index.insert(key, id);
        }

        let committed = StockMovement {
            id,
            product_id: movement.product_id,
            kind: movement.kind,
            delta: movement.delta,
            quantity_before,
            quantity_after,
            unit_price_cents: movement.unit_price_cents,
            reference: movement.reference,
            reason: movement.reason,
            actor: movement.actor,
            idempotency_key: movement.idempotency_key,
            created_at: Utc::now(),
        };

        // Commit: log entry + catalog update together, under the row lock.
        // On failure the key reservation is released again.
        let commit: Result<(), StoreError> = (|| {
            let mut log = self
                .movements
                .write()
                .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
            let mut products = self
                .products
                .write()
                .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
            let product = products
                .get_mut(&movement.product_id)
                .ok_or(StoreError::ProductNotFound)?;
            product.quantity_on_hand = quantity_after;
            log.push(committed.clone());
            Ok(())
        })();
        if let Err(err) = commit {
            if let Some(key) = movement.idempotency_key {
                if let Ok(mut index) = self.idempotency.write() {
                    index.remove(&key);
                }
            }
            return Err(err);
        }

        Ok(committed)
    }

    async fn deactivate_product(&self, id: ProductId) -> Result<(), StoreError> {
        let row_lock = self.lock_for(id);
        let _guard = row_lock.lock().await;

        let mut products = self
            .products
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
        let product = products.get_mut(&id).ok_or(StoreError::ProductNotFound)?;
        if product.quantity_on_hand != 0 {
            return Err(StoreError::ProductHasStock {
                current: product.quantity_on_hand,
            });
        }
        product.active = false;
        Ok(())
    }
}
