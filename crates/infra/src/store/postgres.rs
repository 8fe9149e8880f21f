//! Postgres-backed ledger store.
//!
//! The atomic unit runs in one transaction: `SELECT ... FOR UPDATE` on the
//! product row, validation against the locked quantity, the movement insert,
//! and the catalog update. A `SET LOCAL lock_timeout` bounds each attempt so
//! the retry wrapper (not the database) owns the waiting budget.
//!
//! ## Error mapping
//!
//! | PostgreSQL code | `StoreError` | Retried |
//! |-----------------|--------------|---------|
//! | `40001` (serialization failure), `40P01` (deadlock) | `Serialization` | yes |
//! | `55P03` (lock not available) | `LockTimeout` | yes |
//! | `23505` on the idempotency index | `IdempotencyConflict` | no |
//! | `23505` on the product code index | `DuplicateCode` | no |
//! | anything else | `Backend` | no |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use stockledger_catalog::{MovementKind, NewMovement, NewProduct, Product, StockMovement};
use stockledger_core::{MovementId, ProductId};

use super::r#trait::{LedgerStore, StoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS products (
        id BIGSERIAL PRIMARY KEY,
        code TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        quantity_on_hand BIGINT NOT NULL DEFAULT 0 CHECK (quantity_on_hand >= 0),
        reorder_threshold BIGINT NOT NULL DEFAULT 0,
        max_threshold BIGINT,
        warehouse TEXT,
        active BOOLEAN NOT NULL DEFAULT TRUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stock_movements (
        id BIGSERIAL PRIMARY KEY,
        product_id BIGINT NOT NULL REFERENCES products(id),
        kind TEXT NOT NULL,
        delta BIGINT NOT NULL CHECK (delta <> 0),
        quantity_before BIGINT NOT NULL,
        quantity_after BIGINT NOT NULL CHECK (quantity_after = quantity_before + delta),
        unit_price_cents BIGINT,
        reference TEXT,
        reason TEXT,
        actor TEXT NOT NULL,
        idempotency_key UUID UNIQUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS stock_movements_product_idx
        ON stock_movements (product_id, id)
    "#,
];

/// Postgres-backed catalog + movement log.
///
/// Shares the `PgPool` across clones; all writes go through short
/// transactions scoped to one product row.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
    lock_timeout: Duration,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            lock_timeout: Duration::from_millis(500),
        }
    }

    /// Bound each lock acquisition attempt (per-attempt storage timeout).
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Create the two ledger tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for ddl in SCHEMA {
            sqlx::query(ddl)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self, product), fields(code = %product.code), err)]
    async fn insert_product(&self, product: NewProduct) -> Result<Product, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO products (code, name, reorder_threshold, max_threshold, warehouse)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&product.code)
        .bind(&product.name)
        .bind(product.reorder_threshold)
        .bind(product.max_threshold)
        .bind(&product.warehouse)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateCode(product.code.clone())
            } else {
                map_sqlx_error("insert_product", e)
            }
        })?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| StoreError::Backend(format!("failed to read product id: {e}")))?;

        Ok(Product {
            id: ProductId::new(id),
            code: product.code,
            name: product.name,
            quantity_on_hand: 0,
            reorder_threshold: product.reorder_threshold,
            max_threshold: product.max_threshold,
            warehouse: product.warehouse,
            active: true,
        })
    }

    async fn product(&self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, code, name, quantity_on_hand, reorder_threshold,
                   max_threshold, warehouse, active
            FROM products
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("product", e))?;

        row.map(|r| product_from_row(&r)).transpose()
    }

    async fn active_products(&self) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, code, name, quantity_on_hand, reorder_threshold,
                   max_threshold, warehouse, active
            FROM products
            WHERE active
            ORDER BY id
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_products", e))?;

        rows.iter().map(product_from_row).collect()
    }

    async fn products_below_threshold(
        &self,
        warehouse: Option<&str>,
    ) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, code, name, quantity_on_hand, reorder_threshold,
                   max_threshold, warehouse, active
            FROM products
            WHERE active
              AND quantity_on_hand <= reorder_threshold
              AND ($1::text IS NULL OR warehouse = $1)
            ORDER BY id
            "#,
        )
        .bind(warehouse)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("products_below_threshold", e))?;

        rows.iter().map(product_from_row).collect()
    }

    async fn movements(&self, product_id: ProductId) -> Result<Vec<StockMovement>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, product_id, kind, delta, quantity_before, quantity_after,
                   unit_price_cents, reference, reason, actor, idempotency_key, created_at
            FROM stock_movements
            WHERE product_id = $1
            ORDER BY id
            "#,
        )
        .bind(product_id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("movements", e))?;

        rows.iter().map(movement_from_row).collect()
    }

    async fn find_by_idempotency_key(
        &self,
        key: Uuid,
    ) -> Result<Option<StockMovement>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, product_id, kind, delta, quantity_before, quantity_after,
                   unit_price_cents, reference, reason, actor, idempotency_key, created_at
            FROM stock_movements
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_idempotency_key", e))?;

        row.map(|r| movement_from_row(&r)).transpose()
    }

    #[instrument(
        skip(self, movement),
        fields(product_id = %movement.product_id, delta = movement.delta),
        err
    )]
    async fn apply_movement(&self, movement: NewMovement) -> Result<StockMovement, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        // Per-attempt bound on the row-lock wait. SET cannot take bind
        // parameters; the value is a trusted integer.
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_timeout", e))?;

        let locked = sqlx::query(
            r#"
            SELECT quantity_on_hand, active
            FROM products
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(movement.product_id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_product", e))?;

        let Some(locked) = locked else {
            rollback(tx).await;
            return Err(StoreError::ProductNotFound);
        };

        let quantity_before: i64 = locked
            .try_get("quantity_on_hand")
            .map_err(|e| StoreError::Backend(format!("failed to read quantity: {e}")))?;
        let active: bool = locked
            .try_get("active")
            .map_err(|e| StoreError::Backend(format!("failed to read active flag: {e}")))?;

        if !active {
            rollback(tx).await;
            return Err(StoreError::ProductInactive);
        }

        let Some(quantity_after) = quantity_before.checked_add(movement.delta) else {
            rollback(tx).await;
            return Err(StoreError::Backend(format!(
                "quantity overflow: {quantity_before} + {}",
                movement.delta
            )));
        };
        if quantity_after < 0 {
            rollback(tx).await;
            return Err(StoreError::InsufficientStock {
                current: quantity_before,
            });
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO stock_movements (
                product_id, kind, delta, quantity_before, quantity_after,
                unit_price_cents, reference, reason, actor, idempotency_key
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id, created_at
            "#,
        )
        .bind(movement.product_id.get())
        .bind(movement.kind.as_str())
        .bind(movement.delta)
        .bind(quantity_before)
        .bind(quantity_after)
        .bind(movement.unit_price_cents)
        .bind(&movement.reference)
        .bind(&movement.reason)
        .bind(&movement.actor)
        .bind(movement.idempotency_key)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::IdempotencyConflict
            } else {
                map_sqlx_error("insert_movement", e)
            }
        })?;

        sqlx::query("UPDATE products SET quantity_on_hand = $1 WHERE id = $2")
            .bind(quantity_after)
            .bind(movement.product_id.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_quantity", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        let id: i64 = inserted
            .try_get("id")
            .map_err(|e| StoreError::Backend(format!("failed to read movement id: {e}")))?;
        let created_at: DateTime<Utc> = inserted
            .try_get("created_at")
            .map_err(|e| StoreError::Backend(format!("failed to read created_at: {e}")))?;

        Ok(StockMovement {
            id: MovementId::new(id),
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
            created_at,
        })
    }

    async fn deactivate_product(&self, id: ProductId) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let locked = sqlx::query("SELECT quantity_on_hand FROM products WHERE id = $1 FOR UPDATE")
            .bind(id.get())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_product", e))?;

        let Some(locked) = locked else {
            rollback(tx).await;
            return Err(StoreError::ProductNotFound);
        };

        let current: i64 = locked
            .try_get("quantity_on_hand")
            .map_err(|e| StoreError::Backend(format!("failed to read quantity: {e}")))?;
        if current != 0 {
            rollback(tx).await;
            return Err(StoreError::ProductHasStock { current });
        }

        sqlx::query("UPDATE products SET active = FALSE WHERE id = $1")
            .bind(id.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("deactivate", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }
}

async fn rollback(tx: Transaction<'_, Postgres>) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "rollback failed");
    }
}

fn product_from_row(row: &sqlx::postgres::PgRow) -> Result<Product, StoreError> {
    let read = |e: sqlx::Error| StoreError::Backend(format!("failed to read product row: {e}"));
    Ok(Product {
        id: ProductId::new(row.try_get::<i64, _>("id").map_err(read)?),
        code: row.try_get("code").map_err(read)?,
        name: row.try_get("name").map_err(read)?,
        quantity_on_hand: row.try_get("quantity_on_hand").map_err(read)?,
        reorder_threshold: row.try_get("reorder_threshold").map_err(read)?,
        max_threshold: row.try_get("max_threshold").map_err(read)?,
        warehouse: row.try_get("warehouse").map_err(read)?,
        active: row.try_get("active").map_err(read)?,
    })
}

fn movement_from_row(row: &sqlx::postgres::PgRow) -> Result<StockMovement, StoreError> {
    let read = |e: sqlx::Error| StoreError::Backend(format!("failed to read movement row: {e}"));
    let kind_token: String = row.try_get("kind").map_err(read)?;
    let kind: MovementKind = kind_token
        .parse()
        .map_err(|_| StoreError::Backend(format!("unknown movement kind in log: {kind_token}")))?;

    Ok(StockMovement {
        id: MovementId::new(row.try_get::<i64, _>("id").map_err(read)?),
        product_id: ProductId::new(row.try_get::<i64, _>("product_id").map_err(read)?),
        kind,
        delta: row.try_get("delta").map_err(read)?,
        quantity_before: row.try_get("quantity_before").map_err(read)?,
        quantity_after: row.try_get("quantity_after").map_err(read)?,
        unit_price_cents: row.try_get("unit_price_cents").map_err(read)?,
        reference: row.try_get("reference").map_err(read)?,
        reason: row.try_get("reason").map_err(read)?,
        actor: row.try_get("actor").map_err(read)?,
        idempotency_key: row.try_get("idempotency_key").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Serialization failure / deadlock detected: retryable.
                Some("40001") | Some("40P01") => StoreError::Serialization(msg),
                // Lock not available (lock_timeout expired): retryable.
                Some("55P03") => StoreError::LockTimeout(msg),
                Some("23505") => StoreError::IdempotencyConflict,
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::LockTimeout(format!("pool acquire timed out in {operation}"))
        }
        other => StoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}
