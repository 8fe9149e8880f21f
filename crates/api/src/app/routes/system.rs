use axum::http::StatusCode;
use axum::response::IntoResponse;

pub async fn health() -> axum::response::Response {
    (StatusCode::OK, axum::Json(serde_json::json!({ "status": "ok" }))).into_response()
}
