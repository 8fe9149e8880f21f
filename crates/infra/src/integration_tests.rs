//! End-to-end tests over the in-memory store: ledger core, concurrency
//! controller and consistency auditor working together.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use stockledger_catalog::{
    CriticalityTier, MovementKind, MovementRequest, NewMovement, NewProduct, Product,
    StockMovement,
};
use stockledger_core::{LedgerError, ProductId};

use crate::auditor::{ConsistencyAuditor, REPAIR_REASON};
use crate::ledger::StockLedger;
use crate::retry::RetryPolicy;
use crate::store::{InMemoryLedgerStore, LedgerStore, StoreError};

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1))
}

fn ledger_with_store() -> (Arc<InMemoryLedgerStore>, StockLedger<Arc<InMemoryLedgerStore>>) {
    let store = Arc::new(InMemoryLedgerStore::new());
    let ledger = StockLedger::with_retry_policy(store.clone(), fast_retry());
    (store, ledger)
}

fn new_product(code: &str, threshold: i64) -> NewProduct {
    NewProduct {
        code: code.to_string(),
        name: format!("producto {code}"),
        reorder_threshold: threshold,
        max_threshold: None,
        warehouse: None,
    }
}

fn movement(product_id: ProductId, kind: MovementKind, quantity: i64) -> MovementRequest {
    MovementRequest {
        product_id,
        kind,
        quantity,
        unit_price_cents: None,
        reference: None,
        reason: None,
        actor: "deposito".to_string(),
        idempotency_key: None,
    }
}

async fn seed(ledger: &StockLedger<Arc<InMemoryLedgerStore>>, code: &str, quantity: i64) -> Product {
    let product = ledger.create_product(new_product(code, 10)).await.unwrap();
    if quantity > 0 {
        ledger
            .record_movement(movement(product.id, MovementKind::In, quantity))
            .await
            .unwrap();
    }
    product
}

// ---------------------------------------------------------------------------
// Scenario A/B: plain movements and the non-negativity invariant.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn outbound_movement_returns_before_and_after_snapshots() {
    let (_store, ledger) = ledger_with_store();
    let product = seed(&ledger, "FER-0001", 100).await;

    let result = ledger
        .record_movement(movement(product.id, MovementKind::Out, 30))
        .await
        .unwrap();

    assert_eq!(result.quantity_before, 100);
    assert_eq!(result.quantity_after, 70);
    assert_eq!(ledger.quantity_on_hand(product.id).await.unwrap(), 70);
}

#[tokio::test]
async fn overdraw_is_rejected_and_leaves_no_trace() {
    let (store, ledger) = ledger_with_store();
    let product = seed(&ledger, "FER-0002", 5).await;
    let rows_before = store.movements(product.id).await.unwrap().len();

    let err = ledger
        .record_movement(movement(product.id, MovementKind::Out, 8))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        LedgerError::InsufficientStock {
            current: 5,
            requested: 8
        }
    );
    assert_eq!(ledger.quantity_on_hand(product.id).await.unwrap(), 5);
    assert_eq!(store.movements(product.id).await.unwrap().len(), rows_before);
}

#[tokio::test]
async fn quantity_never_goes_negative_across_a_mixed_sequence() {
    let (store, ledger) = ledger_with_store();
    let product = seed(&ledger, "FER-0003", 10).await;

    let requests = [
        (MovementKind::Out, 4),
        (MovementKind::Out, 7), // rejected: only 6 left
        (MovementKind::In, 2),
        (MovementKind::Adjustment, -8),
        (MovementKind::Adjustment, -1), // rejected: would go to -1
        (MovementKind::TransferOut, 1), // rejected: nothing left
    ];
    for (kind, quantity) in requests {
        let _ = ledger
            .record_movement(movement(product.id, kind, quantity))
            .await;
        assert!(ledger.quantity_on_hand(product.id).await.unwrap() >= 0);
    }

    // Replay from zero reproduces the cached quantity.
    let movements = store.movements(product.id).await.unwrap();
    let folded: i64 = movements.iter().map(|m| m.delta).sum();
    assert_eq!(folded, ledger.quantity_on_hand(product.id).await.unwrap());
}

#[tokio::test]
async fn movement_log_is_ordered_and_chained() {
    let (store, ledger) = ledger_with_store();
    let product = seed(&ledger, "FER-0004", 50).await;
    for quantity in [5, 10, 3] {
        ledger
            .record_movement(movement(product.id, MovementKind::Out, quantity))
            .await
            .unwrap();
    }

    let movements = store.movements(product.id).await.unwrap();
    for pair in movements.windows(2) {
        assert!(pair[0].id < pair[1].id, "IDs must follow commit order");
        assert_eq!(pair[0].quantity_after, pair[1].quantity_before);
    }
    for m in &movements {
        assert_eq!(m.quantity_after, m.quantity_before + m.delta);
        assert_ne!(m.delta, 0);
    }
}

// ---------------------------------------------------------------------------
// Scenario C: idempotency.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn idempotency_key_replays_the_original_result() {
    let (store, ledger) = ledger_with_store();
    let product = seed(&ledger, "FER-0005", 0).await;
    let key = Uuid::now_v7().to_string();

    let mut request = movement(product.id, MovementKind::In, 20);
    request.idempotency_key = Some(key.clone());

    let first = ledger.record_movement(request.clone()).await.unwrap();
    let second = ledger.record_movement(request).await.unwrap();

    assert_eq!(first, second);
    let movements = store.movements(product.id).await.unwrap();
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0].delta, 20);
    assert_eq!(ledger.quantity_on_hand(product.id).await.unwrap(), 20);
}

#[tokio::test]
async fn store_rejects_duplicate_idempotency_key_outright() {
    let (store, ledger) = ledger_with_store();
    let product = seed(&ledger, "FER-0006", 0).await;
    let key = Uuid::now_v7();

    let new = NewMovement {
        product_id: product.id,
        kind: MovementKind::In,
        delta: 7,
        unit_price_cents: None,
        reference: None,
        reason: None,
        actor: "deposito".to_string(),
        idempotency_key: Some(key),
    };

    store.apply_movement(new.clone()).await.unwrap();
    let err = store.apply_movement(new).await.unwrap_err();
    assert!(matches!(err, StoreError::IdempotencyConflict));
    assert_eq!(ledger.quantity_on_hand(product.id).await.unwrap(), 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_idempotency_key_commits_once_across_products() {
    // Different products means different row locks; only the index itself
    // keeps the key unique.
    let store = Arc::new(InMemoryLedgerStore::new());
    let key = Uuid::now_v7();

    let mut products = Vec::new();
    for i in 0..8 {
        products.push(
            store
                .insert_product(new_product(&format!("RACE-{i}"), 10))
                .await
                .unwrap(),
        );
    }

    let mut handles = Vec::new();
    for product in &products {
        let store = store.clone();
        let new = NewMovement {
            product_id: product.id,
            kind: MovementKind::In,
            delta: 1,
            unit_price_cents: None,
            reference: None,
            reason: None,
            actor: "deposito".to_string(),
            idempotency_key: Some(key),
        };
        handles.push(tokio::spawn(async move { store.apply_movement(new).await }));
    }

    let mut successes = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(StoreError::IdempotencyConflict) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(conflicts, 7);

    let winner = store.find_by_idempotency_key(key).await.unwrap().unwrap();
    assert_eq!(winner.idempotency_key, Some(key));
}

#[tokio::test]
async fn quantity_overflow_is_rejected_without_partial_writes() {
    let (store, ledger) = ledger_with_store();
    let product = ledger
        .create_product(new_product("FER-0015", 10))
        .await
        .unwrap();
    ledger
        .record_movement(movement(product.id, MovementKind::In, i64::MAX))
        .await
        .unwrap();

    let err = ledger
        .record_movement(movement(product.id, MovementKind::In, 1))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Storage(_)));
    assert_eq!(ledger.quantity_on_hand(product.id).await.unwrap(), i64::MAX);
    assert_eq!(store.movements(product.id).await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Concurrency: N concurrent OUTs against quantity Q.
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_outs_commit_exactly_the_available_quantity() {
    let (store, _) = ledger_with_store();
    let ledger = Arc::new(StockLedger::with_retry_policy(store.clone(), fast_retry()));
    let product = ledger
        .create_product(new_product("FER-0007", 10))
        .await
        .unwrap();
    ledger
        .record_movement(movement(product.id, MovementKind::In, 5))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ledger = ledger.clone();
        let product_id = product.id;
        handles.push(tokio::spawn(async move {
            ledger
                .record_movement(movement(product_id, MovementKind::Out, 1))
                .await
        }));
    }

    let mut successes = 0;
    let mut insufficient = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(LedgerError::InsufficientStock { .. }) => insufficient += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(successes, 5);
    assert_eq!(insufficient, 3);
    assert_eq!(ledger.quantity_on_hand(product.id).await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Scenario D: drift detection and repair.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn drift_is_reported_then_repaired_through_the_ledger() {
    let (store, ledger) = ledger_with_store();
    let ledger = Arc::new(ledger);
    let auditor = ConsistencyAuditor::new(ledger.clone());

    let product = seed(&ledger, "FER-0008", 10).await;
    assert!(auditor.validate_all().await.unwrap().is_clean());

    // Tamper with the cached quantity behind the ledger's back.
    store.set_quantity_unchecked(product.id, 7);

    let report = auditor.validate_all().await.unwrap();
    assert_eq!(report.drift.len(), 1);
    let entry = &report.drift[0];
    assert_eq!(entry.product_id, product.id);
    assert_eq!(entry.stored_quantity, 7);
    assert_eq!(entry.computed_quantity, 10);
    assert!(entry.last_movement_id.is_some());

    let result = auditor.repair(product.id, "auditor").await.unwrap();
    assert_eq!(result.quantity_before, 7);
    assert_eq!(result.quantity_after, 10);

    // The repair is an audited ADJUSTMENT, not a silent overwrite.
    let movements = store.movements(product.id).await.unwrap();
    let repair = movements.last().unwrap();
    assert_eq!(repair.kind, MovementKind::Adjustment);
    assert_eq!(repair.delta, 3);
    assert_eq!(repair.reason.as_deref(), Some(REPAIR_REASON));

    let report = auditor.validate_all().await.unwrap();
    assert!(report.is_clean(), "second audit must be clean: {report:?}");
}

#[tokio::test]
async fn repair_without_drift_is_rejected() {
    let (_store, ledger) = ledger_with_store();
    let ledger = Arc::new(ledger);
    let auditor = ConsistencyAuditor::new(ledger.clone());
    let product = seed(&ledger, "FER-0009", 10).await;

    let err = auditor.repair(product.id, "auditor").await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidRequest(_)));
}

// ---------------------------------------------------------------------------
// Scenario E + retry exhaustion: transient conflict injection.
// ---------------------------------------------------------------------------

/// Wraps the in-memory store and injects transient conflicts into the
/// atomic unit, alternating inject/pass until the budget is spent.
struct FlakyStore {
    inner: Arc<InMemoryLedgerStore>,
    injections_left: AtomicU32,
    calls: AtomicU32,
    always_fail: bool,
}

impl FlakyStore {
    fn new(inner: Arc<InMemoryLedgerStore>, injections: u32) -> Self {
        Self {
            inner,
            injections_left: AtomicU32::new(injections),
            calls: AtomicU32::new(0),
            always_fail: false,
        }
    }

    fn always_conflicting(inner: Arc<InMemoryLedgerStore>) -> Self {
        Self {
            inner,
            injections_left: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            always_fail: true,
        }
    }
}

#[async_trait]
impl LedgerStore for FlakyStore {
    async fn insert_product(&self, product: NewProduct) -> Result<Product, StoreError> {
        self.inner.insert_product(product).await
    }

    async fn product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        self.inner.product(id).await
    }

    async fn active_products(&self) -> Result<Vec<Product>, StoreError> {
        self.inner.active_products().await
    }

    async fn products_below_threshold(
        &self,
        warehouse: Option<&str>,
    ) -> Result<Vec<Product>, StoreError> {
        self.inner.products_below_threshold(warehouse).await
    }

    async fn movements(&self, product_id: ProductId) -> Result<Vec<StockMovement>, StoreError> {
        self.inner.movements(product_id).await
    }

    async fn find_by_idempotency_key(
        &self,
        key: Uuid,
    ) -> Result<Option<StockMovement>, StoreError> {
        self.inner.find_by_idempotency_key(key).await
    }

    async fn apply_movement(&self, new: NewMovement) -> Result<StockMovement, StoreError> {
        if self.always_fail {
            return Err(StoreError::LockTimeout("row stays locked".to_string()));
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call % 2 == 0 {
            let left = self.injections_left.load(Ordering::SeqCst);
            if left > 0 {
                self.injections_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Serialization(
                    "could not serialize access".to_string(),
                ));
            }
        }
        self.inner.apply_movement(new).await
    }

    async fn deactivate_product(&self, id: ProductId) -> Result<(), StoreError> {
        self.inner.deactivate_product(id).await
    }
}

#[tokio::test]
async fn fifty_injected_conflicts_resolve_without_caller_visible_errors() {
    let inner = Arc::new(InMemoryLedgerStore::new());
    let product = inner.insert_product(new_product("FER-0010", 10)).await.unwrap();

    let flaky = FlakyStore::new(inner.clone(), 50);
    let ledger = StockLedger::with_retry_policy(flaky, fast_retry());

    for _ in 0..50 {
        ledger
            .record_movement(movement(product.id, MovementKind::In, 1))
            .await
            .expect("transient conflicts must be absorbed by the retry policy");
    }

    assert_eq!(ledger.quantity_on_hand(product.id).await.unwrap(), 50);
    assert_eq!(inner.movements(product.id).await.unwrap().len(), 50);
}

#[tokio::test]
async fn unresolvable_contention_surfaces_as_exhaustion() {
    let inner = Arc::new(InMemoryLedgerStore::new());
    let product = inner.insert_product(new_product("FER-0011", 10)).await.unwrap();

    let ledger = StockLedger::with_retry_policy(
        FlakyStore::always_conflicting(inner.clone()),
        fast_retry(),
    );

    let err = ledger
        .record_movement(movement(product.id, MovementKind::In, 1))
        .await
        .unwrap_err();

    match err {
        LedgerError::ConcurrencyExhausted { attempts, .. } => assert_eq!(attempts, 4),
        other => panic!("expected exhaustion, got {other:?}"),
    }
    // No partial writes.
    assert!(inner.movements(product.id).await.unwrap().is_empty());
    assert_eq!(inner.product(product.id).await.unwrap().unwrap().quantity_on_hand, 0);
}

// ---------------------------------------------------------------------------
// Business rejections never reach the retry loop.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_product_is_not_retried() {
    let (_store, ledger) = ledger_with_store();
    let err = ledger
        .record_movement(movement(ProductId::new(999), MovementKind::In, 1))
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::ProductNotFound(ProductId::new(999)));
}

#[tokio::test]
async fn inactive_product_rejects_movements() {
    let (_store, ledger) = ledger_with_store();
    let product = seed(&ledger, "FER-0012", 0).await;
    ledger.deactivate_product(product.id).await.unwrap();

    let err = ledger
        .record_movement(movement(product.id, MovementKind::In, 1))
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::ProductNotFound(product.id));
}

#[tokio::test]
async fn deactivation_requires_an_empty_shelf() {
    let (_store, ledger) = ledger_with_store();
    let product = seed(&ledger, "FER-0013", 3).await;

    let err = ledger.deactivate_product(product.id).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidRequest(_)));

    ledger
        .record_movement(movement(product.id, MovementKind::Out, 3))
        .await
        .unwrap();
    ledger.deactivate_product(product.id).await.unwrap();
}

#[tokio::test]
async fn duplicate_product_code_is_rejected() {
    let (_store, ledger) = ledger_with_store();
    seed(&ledger, "FER-0014", 0).await;
    let err = ledger
        .create_product(new_product("FER-0014", 10))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidRequest(_)));
}

// ---------------------------------------------------------------------------
// Critical-stock read model.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn critical_stock_orders_by_tier_then_quantity() {
    let (_store, ledger) = ledger_with_store();

    // threshold 10 for every product (seed helper).
    let healthy = seed(&ledger, "OK-1", 40).await;
    let low = seed(&ledger, "LOW-1", 8).await;
    let critical_a = seed(&ledger, "CRIT-A", 5).await;
    let critical_b = seed(&ledger, "CRIT-B", 2).await;
    let empty = seed(&ledger, "EMPTY-1", 0).await;

    let alerts = ledger.list_critical_stock(None).await.unwrap();
    let ids: Vec<ProductId> = alerts.iter().map(|a| a.product_id).collect();
    assert_eq!(ids, vec![empty.id, critical_b.id, critical_a.id, low.id]);
    assert!(!ids.contains(&healthy.id));

    assert_eq!(alerts[0].tier, CriticalityTier::OutOfStock);
    assert_eq!(alerts[1].tier, CriticalityTier::Critical);
    assert_eq!(alerts[3].tier, CriticalityTier::Low);
}

#[tokio::test]
async fn critical_stock_honors_the_warehouse_filter() {
    let (_store, ledger) = ledger_with_store();

    let mut caba = new_product("CABA-1", 10);
    caba.warehouse = Some("caba".to_string());
    let caba = ledger.create_product(caba).await.unwrap();

    let mut cordoba = new_product("CBA-1", 10);
    cordoba.warehouse = Some("cordoba".to_string());
    ledger.create_product(cordoba).await.unwrap();

    let alerts = ledger.list_critical_stock(Some("caba")).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].product_id, caba.id);
}
