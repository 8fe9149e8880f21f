use axum::Router;

pub mod products;
pub mod stock;
pub mod system;

/// All ledger routes.
pub fn router() -> Router {
    Router::new()
        .nest("/products", products::router())
        .nest("/stock", stock::router())
}
