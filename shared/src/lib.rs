use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A point-in-time view of a contact, as served by the contact service.
///
/// The automation engine never owns contact records; it fetches a snapshot
/// when it needs to evaluate conditions or goals against current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactSnapshot {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Flat attribute map (first_name, company, custom fields, ...).
    pub attributes: Value,
    pub tags: Vec<String>,
    pub pipeline_stage_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ContactSnapshot {
    /// Empty snapshot for a contact the platform could not resolve.
    /// Condition evaluation treats every attribute as absent.
    pub fn unresolved(tenant_id: Uuid, id: Uuid) -> Self {
        Self {
            id,
            tenant_id,
            email: None,
            phone: None,
            attributes: Value::Object(Default::default()),
            tags: Vec::new(),
            pipeline_stage_id: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

/// Task creation request handed to the task service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub tenant_id: Uuid,
    pub contact_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub assignee_id: Option<Uuid>,
    pub due_at: Option<DateTime<Utc>>,
}

/// Appointment booking request handed to the calendar service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentRequest {
    pub tenant_id: Uuid,
    pub contact_id: Uuid,
    pub calendar_id: Uuid,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub notes: Option<String>,
}

/// Pipeline position used by the move-stage capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStageRef {
    pub pipeline_id: Uuid,
    pub stage_id: Uuid,
}

/// Summary row for the workflow list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub status: String,
    pub version: i32,
    pub step_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Summary row for the enrollment list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentSummary {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: i32,
    pub contact_id: Uuid,
    pub status: String,
    pub current_step_id: Option<Uuid>,
    pub resume_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_snapshot_is_empty() {
        let snap = ContactSnapshot::unresolved(Uuid::new_v4(), Uuid::new_v4());
        assert!(snap.tags.is_empty());
        assert!(snap.attribute("first_name").is_none());
    }

    #[test]
    fn test_tag_check_is_case_insensitive() {
        let mut snap = ContactSnapshot::unresolved(Uuid::new_v4(), Uuid::new_v4());
        snap.tags.push("Lead".to_string());
        assert!(snap.has_tag("lead"));
        assert!(!snap.has_tag("customer"));
    }
}
