use serde::Deserialize;

use stockledger_catalog::{MovementKind, MovementRequest, NewProduct};
use stockledger_core::ProductId;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateProductRequest {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub reorder_threshold: i64,
    pub max_threshold: Option<i64>,
    pub warehouse: Option<String>,
}

impl CreateProductRequest {
    pub fn into_new_product(self) -> NewProduct {
        NewProduct {
            code: self.code,
            name: self.name,
            reorder_threshold: self.reorder_threshold,
            max_threshold: self.max_threshold,
            warehouse: self.warehouse,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RecordMovementRequest {
    pub kind: MovementKind,
    pub quantity: i64,
    pub unit_price_cents: Option<i64>,
    pub reference: Option<String>,
    pub reason: Option<String>,
    pub actor: String,
    pub idempotency_key: Option<String>,
}

impl RecordMovementRequest {
    pub fn into_movement(self, product_id: ProductId) -> MovementRequest {
        MovementRequest {
            product_id,
            kind: self.kind,
            quantity: self.quantity,
            unit_price_cents: self.unit_price_cents,
            reference: self.reference,
            reason: self.reason,
            actor: self.actor,
            idempotency_key: self.idempotency_key,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RepairRequest {
    pub actor: String,
}

#[derive(Debug, Deserialize)]
pub struct WarehouseFilter {
    pub warehouse: Option<String>,
}
