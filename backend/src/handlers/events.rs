// Event ingestion endpoint

use axum::{extract::State, http::StatusCode, response::Json, routing::post, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::automation::{DomainEvent, TriggerType};
use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct EventSubmit {
    pub trigger_type: TriggerType,
    pub tenant_id: Uuid,
    pub contact_id: Uuid,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct EventAccepted {
    pub event_id: Uuid,
    /// Enrollments created by this event.
    pub enrollments: Vec<Uuid>,
}

pub fn event_routes() -> Router<Arc<AppState>> {
    Router::new().route("/", post(submit_event))
}

async fn submit_event(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EventSubmit>,
) -> ApiResult<(StatusCode, Json<EventAccepted>)> {
    let event = DomainEvent::new(
        request.trigger_type,
        request.tenant_id,
        request.contact_id,
        request.payload,
    );
    let enrollments = state.triggers.handle_event(&event).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EventAccepted {
            event_id: event.event_id,
            enrollments,
        }),
    ))
}
