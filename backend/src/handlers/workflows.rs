// Workflow management endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use nurture_shared::{EnrollmentSummary, WorkflowSummary};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::automation::{
    Connection, Enrollment, EnrollmentFilter, EnrollmentStatus, Step, TriggerSpec, Workflow,
    WorkflowStats, WorkflowStatus,
};
use crate::error::{ApiResult, AppError, ValidationBuilder};
use crate::pagination::{EnrollmentListParams, PaginatedResponse};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WorkflowCreate {
    pub tenant_id: Uuid,
    pub name: String,
    pub trigger: TriggerSpec,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub allow_reentry: bool,
}

#[derive(Debug, Deserialize)]
pub struct WorkflowUpdate {
    pub name: Option<String>,
    pub trigger: Option<TriggerSpec>,
    pub steps: Option<Vec<Step>>,
    pub connections: Option<Vec<Connection>>,
    pub allow_reentry: Option<bool>,
}

impl WorkflowUpdate {
    fn is_structural(&self) -> bool {
        self.trigger.is_some() || self.steps.is_some() || self.connections.is_some()
    }
}

#[derive(Debug, Deserialize)]
pub struct WorkflowListQuery {
    pub tenant_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub contact_ids: Vec<Uuid>,
}

pub fn workflow_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_workflows).post(create_workflow))
        .route("/:id", get(get_workflow).put(update_workflow))
        .route("/:id/activate", post(activate_workflow))
        .route("/:id/pause", post(pause_workflow))
        .route("/:id/archive", post(archive_workflow))
        .route("/:id/enroll", post(enroll_contacts))
        .route("/:id/enrollments", get(list_workflow_enrollments))
        .route("/:id/stats", get(workflow_stats))
}

fn summarize(workflow: &Workflow) -> WorkflowSummary {
    WorkflowSummary {
        id: workflow.id,
        tenant_id: workflow.tenant_id,
        name: workflow.name.clone(),
        status: workflow.status.as_str().to_string(),
        version: workflow.version,
        step_count: workflow.steps.len(),
        created_at: workflow.created_at,
        updated_at: workflow.updated_at,
    }
}

fn summarize_enrollment(enrollment: &Enrollment) -> EnrollmentSummary {
    EnrollmentSummary {
        id: enrollment.id,
        workflow_id: enrollment.workflow_id,
        workflow_version: enrollment.workflow_version,
        contact_id: enrollment.contact_id,
        status: enrollment.status.as_str().to_string(),
        current_step_id: enrollment.current_step_id,
        resume_at: enrollment.resume_at,
        created_at: enrollment.created_at,
        updated_at: enrollment.updated_at,
    }
}

async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(request): Json<WorkflowCreate>,
) -> ApiResult<(StatusCode, Json<Workflow>)> {
    let mut validation = ValidationBuilder::new();
    if request.name.trim().is_empty() {
        validation = validation.error("name", "Name is required");
    }
    if request.name.len() > 200 {
        validation = validation.error("name", "Name must be at most 200 characters");
    }
    if let Some(error) = validation.build() {
        return Err(error);
    }

    // Drafts may hold incomplete graphs; validation gates activation.
    let mut workflow = Workflow::new(request.tenant_id, request.name.trim(), request.trigger);
    workflow.steps = request.steps;
    workflow.connections = request.connections;
    workflow.allow_reentry = request.allow_reentry;

    state.store.insert_workflow(&workflow).await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

async fn list_workflows(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WorkflowListQuery>,
) -> ApiResult<Json<Vec<WorkflowSummary>>> {
    let workflows = state.store.list_workflows(query.tenant_id).await?;
    Ok(Json(workflows.iter().map(summarize).collect()))
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Workflow>> {
    let workflow = state
        .store
        .get_workflow(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Workflow".to_string()))?;
    Ok(Json(workflow))
}

async fn update_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<WorkflowUpdate>,
) -> ApiResult<Json<Workflow>> {
    let mut workflow = state
        .store
        .get_workflow(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Workflow".to_string()))?;
    if workflow.status == WorkflowStatus::Archived {
        return Err(AppError::Conflict(
            "Archived workflows are read-only".to_string(),
        ));
    }

    if let Some(name) = &request.name {
        if name.trim().is_empty() {
            return Err(ValidationBuilder::new()
                .error("name", "Name is required")
                .build()
                .unwrap_or(AppError::BadRequest("Name is required".to_string())));
        }
        workflow.name = name.trim().to_string();
    }
    if let Some(allow_reentry) = request.allow_reentry {
        workflow.allow_reentry = allow_reentry;
    }

    // A structural edit pins a new version; enrollments in flight keep
    // the graph they started with.
    if request.is_structural() {
        workflow.version += 1;
        if let Some(trigger) = request.trigger {
            workflow.trigger = trigger;
        }
        if let Some(steps) = request.steps {
            workflow.steps = steps;
        }
        if let Some(connections) = request.connections {
            workflow.connections = connections;
        }
        // An active workflow must stay valid through edits.
        if workflow.status == WorkflowStatus::Active {
            workflow.validate().map_err(AppError::from)?;
        }
    }
    workflow.updated_at = Some(chrono::Utc::now());

    state.store.update_workflow(&workflow).await?;
    if workflow.status == WorkflowStatus::Active {
        state.triggers.rebuild_index().await?;
    }
    Ok(Json(workflow))
}

async fn activate_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Workflow>> {
    let mut workflow = state
        .store
        .get_workflow(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Workflow".to_string()))?;
    workflow.activate().map_err(AppError::from)?;
    state.store.update_workflow(&workflow).await?;
    state.triggers.rebuild_index().await?;
    Ok(Json(workflow))
}

async fn pause_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Workflow>> {
    let mut workflow = state
        .store
        .get_workflow(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Workflow".to_string()))?;
    workflow.pause();
    state.store.update_workflow(&workflow).await?;
    state.triggers.rebuild_index().await?;
    Ok(Json(workflow))
}

async fn archive_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Workflow>> {
    let mut workflow = state
        .store
        .get_workflow(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Workflow".to_string()))?;
    workflow.archive();
    state.store.update_workflow(&workflow).await?;
    state.triggers.rebuild_index().await?;
    Ok(Json(workflow))
}

async fn enroll_contacts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<EnrollRequest>,
) -> ApiResult<Json<crate::automation::EnrollmentBatch>> {
    if request.contact_ids.is_empty() {
        return Err(AppError::BadRequest(
            "contact_ids must not be empty".to_string(),
        ));
    }
    let batch = state
        .triggers
        .enroll_contacts(id, &request.contact_ids)
        .await?;
    Ok(Json(batch))
}

async fn list_workflow_enrollments(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<EnrollmentListParams>,
) -> ApiResult<Json<PaginatedResponse<EnrollmentSummary>>> {
    if state.store.get_workflow(id).await?.is_none() {
        return Err(AppError::NotFound("Workflow".to_string()));
    }

    let status = match &params.status {
        Some(raw) => Some(
            EnrollmentStatus::parse(raw)
                .ok_or_else(|| AppError::BadRequest(format!("Unknown status '{}'", raw)))?,
        ),
        None => None,
    };
    let filter = EnrollmentFilter {
        status,
        created_after: params.created_after,
        created_before: params.created_before,
        limit: params.pagination.limit(),
        offset: params.pagination.offset(),
        ..EnrollmentFilter::for_workflow(id)
    };

    let enrollments = state.store.list_enrollments(&filter).await?;
    let total = state.store.count_enrollments(&filter).await?;
    let data = enrollments.iter().map(summarize_enrollment).collect();
    Ok(Json(PaginatedResponse::new(data, &params.pagination, total)))
}

async fn workflow_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowStats>> {
    if state.store.get_workflow(id).await?.is_none() {
        return Err(AppError::NotFound("Workflow".to_string()));
    }
    let stats = state.stats.summary(id).await?;
    Ok(Json(stats))
}
