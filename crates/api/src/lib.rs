//! HTTP surface for the stock ledger core.

pub mod app;
