//! Consistency auditor: detects and repairs drift between the cached
//! catalog quantity and the movement log.
//!
//! The auditor only reads the store directly. Corrective writes go back
//! through the ledger core as ordinary `ADJUSTMENT` movements, so every
//! repair is itself an audited, immutable log entry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_catalog::{MovementKind, MovementRequest, MovementResult, StockMovement};
use stockledger_core::{LedgerError, LedgerResult, MovementId, ProductId};

use crate::ledger::StockLedger;
use crate::store::LedgerStore;

/// Reason tag carried by every corrective movement.
pub const REPAIR_REASON: &str = "consistency-repair";

/// One drifted product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftEntry {
    pub product_id: ProductId,
    pub stored_quantity: i64,
    pub computed_quantity: i64,
    pub last_movement_id: Option<MovementId>,
}

impl DriftEntry {
    /// Delta a corrective adjustment must apply.
    pub fn correction_delta(&self) -> i64 {
        self.computed_quantity - self.stored_quantity
    }
}

/// Result of a full audit sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub products_checked: usize,
    pub drift: Vec<DriftEntry>,
    pub generated_at: DateTime<Utc>,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.drift.is_empty()
    }
}

/// Replays a product's movement history and compares it to the cached
/// quantity. Holds the ledger so repairs reuse the exact write path every
/// other caller uses.
#[derive(Debug)]
pub struct ConsistencyAuditor<S> {
    ledger: Arc<StockLedger<S>>,
}

impl<S: LedgerStore> ConsistencyAuditor<S> {
    pub fn new(ledger: Arc<StockLedger<S>>) -> Self {
        Self { ledger }
    }

    /// Audit every active product. Read-only; never blocks writers.
    pub async fn validate_all(&self) -> LedgerResult<ConsistencyReport> {
        let products = self
            .ledger
            .store()
            .active_products()
            .await
            .map_err(|e| LedgerError::storage(e.to_string()))?;

        let products_checked = products.len();
        let mut drift = Vec::new();
        for product in products {
            if let Some(entry) = self.audit_product(product.id, product.quantity_on_hand).await? {
                drift.push(entry);
            }
        }

        if drift.is_empty() {
            tracing::info!(products_checked, "consistency audit clean");
        } else {
            tracing::warn!(products_checked, drifted = drift.len(), "consistency drift detected");
        }

        Ok(ConsistencyReport {
            products_checked,
            drift,
            generated_at: Utc::now(),
        })
    }

    /// Audit one product; `None` means log and catalog agree.
    pub async fn validate_product(&self, product_id: ProductId) -> LedgerResult<Option<DriftEntry>> {
        let product = self
            .ledger
            .store()
            .product(product_id)
            .await
            .map_err(|e| LedgerError::storage(e.to_string()))?
            .ok_or(LedgerError::ProductNotFound(product_id))?;
        self.audit_product(product_id, product.quantity_on_hand).await
    }

    /// Emit a corrective `ADJUSTMENT` through the ledger core whose delta is
    /// exactly `computed - stored`. Fails with `InvalidRequest` when there is
    /// no drift to repair.
    pub async fn repair(&self, product_id: ProductId, actor: &str) -> LedgerResult<MovementResult> {
        let entry = self
            .validate_product(product_id)
            .await?
            .ok_or_else(|| LedgerError::invalid_request("no drift detected"))?;

        tracing::warn!(
            %product_id,
            stored = entry.stored_quantity,
            computed = entry.computed_quantity,
            "repairing consistency drift"
        );

        self.ledger
            .record_movement(MovementRequest {
                product_id,
                kind: MovementKind::Adjustment,
                quantity: entry.correction_delta(),
                unit_price_cents: None,
                reference: None,
                reason: Some(REPAIR_REASON.to_string()),
                actor: actor.to_string(),
                idempotency_key: None,
            })
            .await
    }

    async fn audit_product(
        &self,
        product_id: ProductId,
        stored_quantity: i64,
    ) -> LedgerResult<Option<DriftEntry>> {
        let movements = self
            .ledger
            .store()
            .movements(product_id)
            .await
            .map_err(|e| LedgerError::storage(e.to_string()))?;

        let computed_quantity = replay(&movements);
        if computed_quantity == stored_quantity {
            return Ok(None);
        }

        Ok(Some(DriftEntry {
            product_id,
            stored_quantity,
            computed_quantity,
            last_movement_id: movements.last().map(|m| m.id),
        }))
    }
}

/// Fold a movement history (in creation order) into the implied quantity.
///
/// Each movement's snapshots are trusted: when the chain is intact the fold
/// equals the plain delta sum from zero, and after a corrective adjustment
/// (whose `quantity_before` records the drifted value) it converges on the
/// last committed `quantity_after` instead of double-counting the repair.
pub fn replay(movements: &[StockMovement]) -> i64 {
    let mut computed = 0;
    for movement in movements {
        if movement.quantity_before != computed {
            tracing::debug!(
                movement_id = %movement.id,
                expected = computed,
                recorded = movement.quantity_before,
                "movement chain break (prior external write or repair)"
            );
        }
        computed = movement.quantity_after;
    }
    computed
}
