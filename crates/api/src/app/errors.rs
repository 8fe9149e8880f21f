use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use stockledger_core::LedgerError;

/// Map a ledger error onto a stable JSON error response.
///
/// `InsufficientStock` keeps the current quantity in the body so callers can
/// render it; the core itself does no UI formatting.
pub fn ledger_error_to_response(err: LedgerError) -> axum::response::Response {
    match err {
        LedgerError::ProductNotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "product_not_found",
            format!("product {id} not found or inactive"),
        ),
        LedgerError::InsufficientStock { current, requested } => (
            StatusCode::CONFLICT,
            axum::Json(json!({
                "error": "insufficient_stock",
                "message": format!("insufficient stock: {current} on hand, {requested} requested"),
                "current_quantity": current,
                "requested": requested,
            })),
        )
            .into_response(),
        LedgerError::InvalidRequest(msg) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_request", msg)
        }
        LedgerError::ConcurrencyExhausted { attempts, last } => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "concurrency_exhausted",
            format!("gave up after {attempts} attempts: {last}"),
        ),
        LedgerError::Storage(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
