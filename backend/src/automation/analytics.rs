// Workflow Analytics - per-workflow funnel counters
//
// Counters are incremented through an idempotence ledger keyed by
// enrollment id, so replaying a terminal transition (scheduler retry,
// crash between save and count) never double-counts.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::engine::{Enrollment, EnrollmentStatus};
use super::store::{AutomationStore, StoreError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    Triggered,
    Completed,
    Failed,
}

impl StatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Lifetime counters for one workflow across all of its versions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowStats {
    pub workflow_id: Uuid,
    pub triggered: i64,
    pub completed: i64,
    pub failed: i64,
}

impl WorkflowStats {
    pub fn empty(workflow_id: Uuid) -> Self {
        Self {
            workflow_id,
            triggered: 0,
            completed: 0,
            failed: 0,
        }
    }
}

#[derive(Clone)]
pub struct StatsAggregator {
    store: Arc<dyn AutomationStore>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn AutomationStore>) -> Self {
        Self { store }
    }

    pub async fn record_triggered(
        &self,
        workflow_id: Uuid,
        enrollment_id: Uuid,
    ) -> Result<(), StoreError> {
        self.record(workflow_id, enrollment_id, StatKind::Triggered)
            .await
    }

    /// Count a terminal transition. Cancellations end the run without
    /// saying anything about the funnel, so they are not counted.
    pub async fn record_terminal(&self, enrollment: &Enrollment) -> Result<(), StoreError> {
        let kind = match enrollment.status {
            EnrollmentStatus::Completed => StatKind::Completed,
            EnrollmentStatus::Failed => StatKind::Failed,
            _ => return Ok(()),
        };
        self.record(enrollment.workflow_id, enrollment.id, kind).await
    }

    pub async fn summary(&self, workflow_id: Uuid) -> Result<WorkflowStats, StoreError> {
        self.store.workflow_stats(workflow_id).await
    }

    async fn record(
        &self,
        workflow_id: Uuid,
        enrollment_id: Uuid,
        kind: StatKind,
    ) -> Result<(), StoreError> {
        let counted = self
            .store
            .record_stat(workflow_id, enrollment_id, kind)
            .await?;
        if !counted {
            debug!(
                workflow = %workflow_id,
                enrollment = %enrollment_id,
                kind = kind.as_str(),
                "stat already recorded, skipping"
            );
        }
        Ok(())
    }
}
