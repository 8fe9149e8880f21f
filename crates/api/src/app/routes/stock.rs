use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/critical", get(critical_stock))
        .route("/consistency", get(consistency_report))
}

pub async fn critical_stock(
    Extension(services): Extension<Arc<AppServices>>,
    Query(filter): Query<dto::WarehouseFilter>,
) -> axum::response::Response {
    match services
        .ledger
        .list_critical_stock(filter.warehouse.as_deref())
        .await
    {
        Ok(alerts) => Json(alerts).into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}

pub async fn consistency_report(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.auditor.validate_all().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::ledger_error_to_response(e),
    }
}
