use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;

use crate::AppState;

pub mod enrollments;
pub mod events;
pub mod workflows;

pub use enrollments::enrollment_routes;
pub use events::event_routes;
pub use workflows::workflow_routes;

pub fn health_routes() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

async fn health(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let database = crate::database::health_check(&state.db_pool).await;
    let status = if database { "ok" } else { "degraded" };
    let code = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": status,
            "database": database,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}
