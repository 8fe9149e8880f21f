//! Catalog domain module.
//!
//! This crate contains the business rules of the stock ledger as
//! deterministic domain logic (no IO, no HTTP, no storage): products and
//! their thresholds, movement requests and validation, and the single
//! criticality computation shared by every consumer.

pub mod movement;
pub mod product;

pub use movement::{
    MovementKind, MovementRequest, MovementResult, NewMovement, StockMovement,
};
pub use product::{criticality, CriticalityTier, NewProduct, Product, ProductAlert};
