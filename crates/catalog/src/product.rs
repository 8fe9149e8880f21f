use serde::{Deserialize, Serialize};

use stockledger_core::{LedgerError, LedgerResult, ProductId};

/// One stock-keeping unit with its denormalized quantity on hand.
///
/// `quantity_on_hand` is mutated exclusively by the ledger core and is
/// invariantly >= 0. Deletion is logical (`active = false`) and only allowed
/// at zero quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    /// Unique human code (e.g. "FER-0031").
    pub code: String,
    pub name: String,
    pub quantity_on_hand: i64,
    pub reorder_threshold: i64,
    /// Upper stocking bound; when set, must exceed `reorder_threshold`.
    pub max_threshold: Option<i64>,
    /// Optional depot/warehouse tag used by the critical-stock filter.
    pub warehouse: Option<String>,
    pub active: bool,
}

/// Input for registering a product in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProduct {
    pub code: String,
    pub name: String,
    pub reorder_threshold: i64,
    pub max_threshold: Option<i64>,
    pub warehouse: Option<String>,
}

impl NewProduct {
    /// Deterministic validation, applied before the catalog is touched.
    pub fn validate(&self) -> LedgerResult<()> {
        if self.code.trim().is_empty() {
            return Err(LedgerError::invalid_request("code cannot be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(LedgerError::invalid_request("name cannot be empty"));
        }
        if self.reorder_threshold < 0 {
            return Err(LedgerError::invalid_request(
                "reorder_threshold cannot be negative",
            ));
        }
        if let Some(max) = self.max_threshold {
            if max <= self.reorder_threshold {
                return Err(LedgerError::invalid_request(
                    "max_threshold must exceed reorder_threshold",
                ));
            }
        }
        Ok(())
    }
}

/// Stock level relative to the reorder threshold.
///
/// Variant order is the report order: out-of-stock rows sort first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CriticalityTier {
    OutOfStock,
    Critical,
    Low,
}

/// Classify a stock level against its reorder threshold.
///
/// Returns `None` when the product is above threshold (not critical at all).
/// The cutoffs: zero on hand is `OutOfStock`, at or below half the threshold
/// is `Critical`, anything else at or below the threshold is `Low`.
pub fn criticality(quantity_on_hand: i64, reorder_threshold: i64) -> Option<CriticalityTier> {
    if quantity_on_hand > reorder_threshold {
        return None;
    }
    if quantity_on_hand == 0 {
        Some(CriticalityTier::OutOfStock)
    } else if quantity_on_hand * 2 <= reorder_threshold {
        Some(CriticalityTier::Critical)
    } else {
        Some(CriticalityTier::Low)
    }
}

/// One row of the critical-stock report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductAlert {
    pub product_id: ProductId,
    pub code: String,
    pub name: String,
    pub quantity_on_hand: i64,
    pub reorder_threshold: i64,
    pub warehouse: Option<String>,
    pub tier: CriticalityTier,
}

impl ProductAlert {
    /// Build an alert for a product, or `None` if it is above threshold.
    pub fn for_product(product: &Product) -> Option<Self> {
        let tier = criticality(product.quantity_on_hand, product.reorder_threshold)?;
        Some(Self {
            product_id: product.id,
            code: product.code.clone(),
            name: product.name.clone(),
            quantity_on_hand: product.quantity_on_hand,
            reorder_threshold: product.reorder_threshold,
            warehouse: product.warehouse.clone(),
            tier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_product(code: &str) -> NewProduct {
        NewProduct {
            code: code.to_string(),
            name: "Tornillo 4mm".to_string(),
            reorder_threshold: 10,
            max_threshold: Some(100),
            warehouse: None,
        }
    }

    #[test]
    fn valid_product_passes() {
        assert!(new_product("FER-0031").validate().is_ok());
    }

    #[test]
    fn empty_code_is_rejected() {
        let err = new_product("  ").validate().unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRequest(_)));
    }

    #[test]
    fn max_threshold_must_exceed_reorder_threshold() {
        let mut p = new_product("FER-0031");
        p.max_threshold = Some(10);
        let err = p.validate().unwrap_err();
        match err {
            LedgerError::InvalidRequest(msg) => assert!(msg.contains("max_threshold")),
            other => panic!("expected InvalidRequest, got {other:?}"),
        }
    }

    #[test]
    fn tier_boundaries() {
        // threshold 10: 0 -> out of stock, 1..=5 -> critical, 6..=10 -> low
        assert_eq!(criticality(0, 10), Some(CriticalityTier::OutOfStock));
        assert_eq!(criticality(1, 10), Some(CriticalityTier::Critical));
        assert_eq!(criticality(5, 10), Some(CriticalityTier::Critical));
        assert_eq!(criticality(6, 10), Some(CriticalityTier::Low));
        assert_eq!(criticality(10, 10), Some(CriticalityTier::Low));
        assert_eq!(criticality(11, 10), None);
    }

    #[test]
    fn zero_threshold_only_flags_empty_shelves() {
        assert_eq!(criticality(0, 0), Some(CriticalityTier::OutOfStock));
        assert_eq!(criticality(1, 0), None);
    }

    #[test]
    fn tiers_sort_in_report_order() {
        let mut tiers = vec![
            CriticalityTier::Low,
            CriticalityTier::OutOfStock,
            CriticalityTier::Critical,
        ];
        tiers.sort();
        assert_eq!(
            tiers,
            vec![
                CriticalityTier::OutOfStock,
                CriticalityTier::Critical,
                CriticalityTier::Low,
            ]
        );
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: every quantity at or below the threshold is assigned
            /// exactly one tier, and quantities above it none.
            #[test]
            fn classification_is_total_below_threshold(
                quantity in 0i64..10_000,
                threshold in 0i64..10_000,
            ) {
                let tier = criticality(quantity, threshold);
                if quantity > threshold {
                    prop_assert!(tier.is_none());
                } else {
                    prop_assert!(tier.is_some());
                }
            }

            /// Property: within a fixed threshold, the tier never improves as
            /// the quantity drops.
            #[test]
            fn tier_is_monotone_in_quantity(
                quantity in 1i64..10_000,
                threshold in 1i64..10_000,
            ) {
                let lower = criticality(quantity - 1, threshold);
                let higher = criticality(quantity, threshold);
                if let (Some(l), Some(h)) = (lower, higher) {
                    prop_assert!(l <= h);
                }
            }
        }
    }
}
