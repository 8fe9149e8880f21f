//! Service wiring: store selection and ledger construction from the
//! environment.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;

use stockledger_infra::{
    ConsistencyAuditor, InMemoryLedgerStore, LedgerStore, PostgresLedgerStore, RetryPolicy,
    StockLedger,
};

/// Shared application services handed to every handler.
pub struct AppServices {
    pub ledger: Arc<StockLedger<Arc<dyn LedgerStore>>>,
    pub auditor: ConsistencyAuditor<Arc<dyn LedgerStore>>,
}

impl AppServices {
    pub fn new(store: Arc<dyn LedgerStore>, retry: RetryPolicy) -> Self {
        let ledger = Arc::new(StockLedger::with_retry_policy(store, retry));
        let auditor = ConsistencyAuditor::new(ledger.clone());
        Self { ledger, auditor }
    }

    /// In-memory wiring with default retries; used by tests.
    pub fn in_memory() -> Self {
        let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedgerStore::new());
        Self::new(store, RetryPolicy::default())
    }
}

/// Build services from the environment.
///
/// `DATABASE_URL` selects Postgres; without it the service runs on the
/// in-memory store (dev mode). Retry knobs: `LEDGER_MAX_RETRIES`,
/// `LEDGER_BASE_DELAY_MS`, `LEDGER_LOCK_TIMEOUT_MS`.
pub async fn build_services() -> anyhow::Result<AppServices> {
    let retry = RetryPolicy::new(
        env_u64("LEDGER_MAX_RETRIES", 3) as u32,
        Duration::from_millis(env_u64("LEDGER_BASE_DELAY_MS", 100)),
    );

    let store: Arc<dyn LedgerStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = PgPoolOptions::new().max_connections(16).connect(&url).await?;
            let store = PostgresLedgerStore::new(pool).with_lock_timeout(Duration::from_millis(
                env_u64("LEDGER_LOCK_TIMEOUT_MS", 500),
            ));
            store.ensure_schema().await?;
            tracing::info!("using postgres ledger store");
            Arc::new(store)
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; using in-memory ledger store");
            Arc::new(InMemoryLedgerStore::new())
        }
    };

    Ok(AppServices::new(store, retry))
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(%name, %raw, "ignoring non-numeric env var");
            default
        }),
        Err(_) => default,
    }
}
