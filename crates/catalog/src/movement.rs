use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockledger_core::{LedgerError, LedgerResult, MovementId, ProductId};

/// Kind of stock movement.
///
/// Transfers are two independent movements (`TransferOut` on the source,
/// `TransferIn` on the destination) issued by the caller; the ledger does not
/// couple the two halves.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementKind {
    In,
    Out,
    Adjustment,
    TransferOut,
    TransferIn,
}

impl MovementKind {
    /// Wire/storage token, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::In => "IN",
            MovementKind::Out => "OUT",
            MovementKind::Adjustment => "ADJUSTMENT",
            MovementKind::TransferOut => "TRANSFER_OUT",
            MovementKind::TransferIn => "TRANSFER_IN",
        }
    }
}

impl core::fmt::Display for MovementKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MovementKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN" => Ok(MovementKind::In),
            "OUT" => Ok(MovementKind::Out),
            "ADJUSTMENT" => Ok(MovementKind::Adjustment),
            "TRANSFER_OUT" => Ok(MovementKind::TransferOut),
            "TRANSFER_IN" => Ok(MovementKind::TransferIn),
            other => Err(LedgerError::invalid_request(format!(
                "unknown movement kind: {other}"
            ))),
        }
    }
}

/// A movement as requested by a caller, before validation.
///
/// `quantity` is positive for `IN`/`OUT`/`TRANSFER_*` (the kind selects the
/// direction); for `ADJUSTMENT` it is signed and non-zero. The idempotency
/// key, when present, must be a UUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRequest {
    pub product_id: ProductId,
    pub kind: MovementKind,
    pub quantity: i64,
    /// Price per unit in the smallest currency unit (centavos).
    pub unit_price_cents: Option<i64>,
    pub reference: Option<String>,
    pub reason: Option<String>,
    pub actor: String,
    pub idempotency_key: Option<String>,
}

impl MovementRequest {
    /// Validate the request and normalize it into a storage-ready movement.
    ///
    /// Runs before any lock is taken; every rejection here is
    /// `LedgerError::InvalidRequest`.
    pub fn validate(&self) -> LedgerResult<NewMovement> {
        if self.quantity == 0 {
            return Err(LedgerError::invalid_request("quantity cannot be zero"));
        }
        if self.quantity < 0 && self.kind != MovementKind::Adjustment {
            return Err(LedgerError::invalid_request(
                "quantity must be positive for IN/OUT/TRANSFER movements",
            ));
        }
        if self.actor.trim().is_empty() {
            return Err(LedgerError::invalid_request("actor cannot be empty"));
        }
        if let Some(price) = self.unit_price_cents {
            if price < 0 {
                return Err(LedgerError::invalid_request(
                    "unit_price_cents cannot be negative",
                ));
            }
        }

        let idempotency_key = match &self.idempotency_key {
            Some(raw) => Some(Uuid::parse_str(raw).map_err(|_| {
                LedgerError::invalid_request("malformed idempotency key (must be a UUID)")
            })?),
            None => None,
        };

        Ok(NewMovement {
            product_id: self.product_id,
            kind: self.kind,
            delta: self.signed_delta(),
            unit_price_cents: self.unit_price_cents,
            reference: self.reference.clone(),
            reason: self.reason.clone(),
            actor: self.actor.clone(),
            idempotency_key,
        })
    }

    /// Signed delta actually applied to the quantity on hand.
    pub fn signed_delta(&self) -> i64 {
        match self.kind {
            MovementKind::In | MovementKind::TransferIn => self.quantity,
            MovementKind::Out | MovementKind::TransferOut => -self.quantity,
            MovementKind::Adjustment => self.quantity,
        }
    }
}

/// A validated movement, ready for the atomic read-validate-write unit.
///
/// `delta` is signed and non-zero; the idempotency key is already parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMovement {
    pub product_id: ProductId,
    pub kind: MovementKind,
    pub delta: i64,
    pub unit_price_cents: Option<i64>,
    pub reference: Option<String>,
    pub reason: Option<String>,
    pub actor: String,
    pub idempotency_key: Option<Uuid>,
}

/// One committed, immutable stock movement.
///
/// Append-only: once returned by the store, a movement is never updated or
/// deleted. `quantity_after = quantity_before + delta` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: MovementId,
    pub product_id: ProductId,
    pub kind: MovementKind,
    pub delta: i64,
    pub quantity_before: i64,
    pub quantity_after: i64,
    pub unit_price_cents: Option<i64>,
    pub reference: Option<String>,
    pub reason: Option<String>,
    pub actor: String,
    pub idempotency_key: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl StockMovement {
    /// The slice of a movement a caller gets back.
    pub fn result(&self) -> MovementResult {
        MovementResult {
            movement_id: self.id,
            quantity_before: self.quantity_before,
            quantity_after: self.quantity_after,
        }
    }
}

/// Outcome of a successfully recorded movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementResult {
    pub movement_id: MovementId,
    pub quantity_before: i64,
    pub quantity_after: i64,
}
