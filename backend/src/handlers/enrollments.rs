// Enrollment inspection and cancellation endpoints

use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::automation::Enrollment;
use crate::error::{ApiResult, AppError};
use crate::AppState;

pub fn enrollment_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id", get(get_enrollment))
        .route("/:id/cancel", post(cancel_enrollment))
}

async fn get_enrollment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Enrollment>> {
    let enrollment = state
        .store
        .get_enrollment(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Enrollment".to_string()))?;
    Ok(Json(enrollment))
}

async fn cancel_enrollment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Enrollment>> {
    if state.store.get_enrollment(id).await?.is_none() {
        return Err(AppError::NotFound("Enrollment".to_string()));
    }
    if !state.store.cancel_enrollment(id).await? {
        return Err(AppError::Conflict(
            "Enrollment is already in a terminal state".to_string(),
        ));
    }
    let enrollment = state
        .store
        .get_enrollment(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Enrollment".to_string()))?;
    Ok(Json(enrollment))
}
