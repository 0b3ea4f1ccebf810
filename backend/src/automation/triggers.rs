// Trigger Dispatcher - routes domain events into enrollments
//
// Keeps an in-memory index from trigger type to active workflow ids so an
// event only touches the workflows that could possibly match. The index
// is rebuilt on workflow lifecycle changes; matching against the event
// payload happens per workflow.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::analytics::StatsAggregator;
use super::definition::{Workflow, WorkflowStatus};
use super::engine::{Enrollment, EngineError, EnrollmentEngine};
use super::store::AutomationStore;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    ContactCreated,
    TagAdded,
    TagRemoved,
    FormSubmitted,
    EmailOpened,
    EmailClicked,
    AppointmentBooked,
    PipelineStageChanged,
    InboundSms,
    MissedCall,
    WebhookReceived,
    Scheduled,
    Manual,
}

/// A typed event from elsewhere in the platform, as received on the
/// ingestion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub trigger_type: TriggerType,
    pub tenant_id: Uuid,
    pub contact_id: Uuid,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(trigger_type: TriggerType, tenant_id: Uuid, contact_id: Uuid, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            trigger_type,
            tenant_id,
            contact_id,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn contact_created(tenant_id: Uuid, contact_id: Uuid) -> Self {
        Self::new(TriggerType::ContactCreated, tenant_id, contact_id, Value::Null)
    }

    pub fn tag_added(tenant_id: Uuid, contact_id: Uuid, tag: &str) -> Self {
        Self::new(
            TriggerType::TagAdded,
            tenant_id,
            contact_id,
            serde_json::json!({ "tag": tag }),
        )
    }

    pub fn form_submitted(tenant_id: Uuid, contact_id: Uuid, form_id: &str, fields: Value) -> Self {
        Self::new(
            TriggerType::FormSubmitted,
            tenant_id,
            contact_id,
            serde_json::json!({ "form_id": form_id, "fields": fields }),
        )
    }

    pub fn pipeline_stage_changed(
        tenant_id: Uuid,
        contact_id: Uuid,
        pipeline_id: Uuid,
        stage_id: Uuid,
    ) -> Self {
        Self::new(
            TriggerType::PipelineStageChanged,
            tenant_id,
            contact_id,
            serde_json::json!({ "pipeline_id": pipeline_id, "stage_id": stage_id }),
        )
    }
}

/// What a workflow listens for: a trigger type plus optional top-level
/// payload equality filters (e.g. only `form_id = "f-1"` submissions).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerSpec {
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub filters: Value,
}

impl TriggerSpec {
    pub fn on(trigger_type: TriggerType) -> Self {
        Self {
            trigger_type,
            filters: Value::Null,
        }
    }

    pub fn with_filter(mut self, key: &str, value: Value) -> Self {
        if !self.filters.is_object() {
            self.filters = Value::Object(serde_json::Map::new());
        }
        if let Some(map) = self.filters.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        self
    }

    /// Every declared filter key must equal the corresponding top-level
    /// payload field. No filters means the type alone matches.
    pub fn matches(&self, event: &DomainEvent) -> bool {
        if self.trigger_type != event.trigger_type {
            return false;
        }
        match self.filters.as_object() {
            Some(filters) => filters
                .iter()
                .all(|(key, expected)| event.payload.get(key) == Some(expected)),
            None => true,
        }
    }
}

/// Result of a manual/bulk enrollment request.
#[derive(Debug, Clone, Serialize, Default)]
pub struct EnrollmentBatch {
    pub enrolled: Vec<Uuid>,
    pub skipped: Vec<Uuid>,
}

pub struct TriggerDispatcher {
    store: Arc<dyn AutomationStore>,
    engine: Arc<EnrollmentEngine>,
    stats: StatsAggregator,
    index: RwLock<HashMap<TriggerType, Vec<Uuid>>>,
}

impl TriggerDispatcher {
    pub fn new(
        store: Arc<dyn AutomationStore>,
        engine: Arc<EnrollmentEngine>,
        stats: StatsAggregator,
    ) -> Self {
        Self {
            store,
            engine,
            stats,
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the type -> workflow index from the set of active
    /// workflows. Called at startup and after any lifecycle change.
    pub async fn rebuild_index(&self) -> Result<(), EngineError> {
        let workflows = self.store.list_active_workflows().await?;
        let mut index: HashMap<TriggerType, Vec<Uuid>> = HashMap::new();
        for workflow in &workflows {
            index
                .entry(workflow.trigger.trigger_type)
                .or_default()
                .push(workflow.id);
        }
        info!(workflows = workflows.len(), "trigger index rebuilt");
        *self.index.write().await = index;
        Ok(())
    }

    /// Route one event: enroll the contact into every matching active
    /// workflow and run each new enrollment immediately. Returns the ids
    /// of the enrollments created.
    pub async fn handle_event(&self, event: &DomainEvent) -> Result<Vec<Uuid>, EngineError> {
        let candidates = {
            let index = self.index.read().await;
            index.get(&event.trigger_type).cloned().unwrap_or_default()
        };

        let mut enrolled = Vec::new();
        for workflow_id in candidates {
            let Some(workflow) = self.store.get_workflow(workflow_id).await? else {
                continue;
            };
            if workflow.status != WorkflowStatus::Active
                || workflow.tenant_id != event.tenant_id
                || !workflow.trigger.matches(event)
            {
                continue;
            }
            if let Some(id) = self
                .enroll(&workflow, event.contact_id, event.payload.clone())
                .await?
            {
                enrolled.push(id);
            }
        }

        debug!(
            event = %event.event_id,
            trigger = ?event.trigger_type,
            enrolled = enrolled.len(),
            "event routed"
        );
        Ok(enrolled)
    }

    /// Manual/bulk enrollment, bypassing event matching. The workflow
    /// must still be active; the re-entry policy still applies.
    pub async fn enroll_contacts(
        &self,
        workflow_id: Uuid,
        contact_ids: &[Uuid],
    ) -> Result<EnrollmentBatch, EngineError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or(EngineError::WorkflowMissing(workflow_id))?;
        if workflow.status != WorkflowStatus::Active {
            return Err(EngineError::WorkflowNotActive(workflow_id));
        }

        let mut batch = EnrollmentBatch::default();
        for &contact_id in contact_ids {
            let payload = serde_json::json!({ "source": "manual" });
            match self.enroll(&workflow, contact_id, payload).await? {
                Some(id) => batch.enrolled.push(id),
                None => batch.skipped.push(contact_id),
            }
        }
        Ok(batch)
    }

    /// Create the enrollment row and run it. Returns None when the
    /// re-entry policy skipped the contact.
    async fn enroll(
        &self,
        workflow: &Workflow,
        contact_id: Uuid,
        payload: Value,
    ) -> Result<Option<Uuid>, EngineError> {
        let enrollment = Enrollment::new(workflow, contact_id, payload);
        let inserted = self
            .store
            .try_insert_enrollment(&enrollment, workflow.allow_reentry)
            .await?;
        if !inserted {
            debug!(
                workflow = %workflow.id,
                contact = %contact_id,
                "contact already has an open enrollment, skipping"
            );
            return Ok(None);
        }

        self.stats.record_triggered(workflow.id, enrollment.id).await?;
        info!(
            enrollment = %enrollment.id,
            workflow = %workflow.id,
            contact = %contact_id,
            "contact enrolled"
        );
        self.engine.run(enrollment.id).await?;
        Ok(Some(enrollment.id))
    }
}
