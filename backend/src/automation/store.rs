// Automation Store - durable state behind the engine
//
// Everything the engine, dispatcher and scheduler persist goes through
// the `AutomationStore` trait: workflows with their pinned versions,
// enrollments, the scheduler's due-queue claim and the stats ledger.
// `PgStore` is the production implementation; `MemoryStore` backs the
// test suite with the same atomicity semantics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool, QueryBuilder, Row};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

use super::analytics::{StatKind, WorkflowStats};
use super::definition::{Connection, Step, Workflow, WorkflowStatus};
use super::engine::{Enrollment, EnrollmentStatus, HistoryEntry};
use super::triggers::TriggerSpec;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt stored record: {0}")]
    Corrupt(String),
    #[error("record not found")]
    NotFound,
}

/// Filter for enrollment listings. `limit`/`offset` always apply.
#[derive(Debug, Clone, Default)]
pub struct EnrollmentFilter {
    pub workflow_id: Option<Uuid>,
    pub status: Option<EnrollmentStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl EnrollmentFilter {
    pub fn for_workflow(workflow_id: Uuid) -> Self {
        Self {
            workflow_id: Some(workflow_id),
            limit: 50,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait AutomationStore: Send + Sync {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    /// Persist an edit. A structural change comes in with a bumped
    /// `version`; the matching version row is written alongside so
    /// in-flight enrollments keep their pinned graph.
    async fn update_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError>;

    async fn get_workflow_version(
        &self,
        id: Uuid,
        version: i32,
    ) -> Result<Option<Workflow>, StoreError>;

    async fn list_workflows(&self, tenant_id: Uuid) -> Result<Vec<Workflow>, StoreError>;

    async fn list_active_workflows(&self) -> Result<Vec<Workflow>, StoreError>;

    /// Atomic re-entry check plus insert. Returns false when the contact
    /// already holds an open enrollment and the workflow forbids
    /// re-entry; concurrent callers race on a unique index, so exactly
    /// one wins.
    async fn try_insert_enrollment(
        &self,
        enrollment: &Enrollment,
        allow_reentry: bool,
    ) -> Result<bool, StoreError>;

    async fn get_enrollment(&self, id: Uuid) -> Result<Option<Enrollment>, StoreError>;

    async fn save_enrollment(&self, enrollment: &Enrollment) -> Result<(), StoreError>;

    /// Cooperative cancel: flips a non-terminal enrollment to
    /// `cancelled`. Returns false if it was already terminal.
    async fn cancel_enrollment(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn list_enrollments(
        &self,
        filter: &EnrollmentFilter,
    ) -> Result<Vec<Enrollment>, StoreError>;

    async fn count_enrollments(&self, filter: &EnrollmentFilter) -> Result<i64, StoreError>;

    /// Claim every enrollment whose `resume_at` has elapsed, marking it
    /// active and clearing `resume_at` in the same statement. The claim
    /// is exclusive: two scheduler workers never both get the same id.
    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, StoreError>;

    /// Bump a workflow counter through the idempotence ledger. Returns
    /// false when this (enrollment, kind) was already counted.
    async fn record_stat(
        &self,
        workflow_id: Uuid,
        enrollment_id: Uuid,
        kind: StatKind,
    ) -> Result<bool, StoreError>;

    async fn workflow_stats(&self, workflow_id: Uuid) -> Result<WorkflowStats, StoreError>;
}

/// The graph portion of a workflow, stored as one jsonb document.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDefinition {
    trigger: TriggerSpec,
    steps: Vec<Step>,
    connections: Vec<Connection>,
}

impl StoredDefinition {
    fn of(workflow: &Workflow) -> Self {
        Self {
            trigger: workflow.trigger.clone(),
            steps: workflow.steps.clone(),
            connections: workflow.connections.clone(),
        }
    }
}

#[derive(Debug, FromRow)]
struct WorkflowRow {
    id: Uuid,
    tenant_id: Uuid,
    name: String,
    status: String,
    version: i32,
    allow_reentry: bool,
    definition: Value,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl WorkflowRow {
    fn into_workflow(self) -> Result<Workflow, StoreError> {
        let status = WorkflowStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("workflow status {:?}", self.status)))?;
        let definition: StoredDefinition = serde_json::from_value(self.definition)?;
        Ok(Workflow {
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name,
            status,
            version: self.version,
            trigger: definition.trigger,
            steps: definition.steps,
            connections: definition.connections,
            allow_reentry: self.allow_reentry,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct EnrollmentRow {
    id: Uuid,
    workflow_id: Uuid,
    workflow_version: i32,
    tenant_id: Uuid,
    contact_id: Uuid,
    current_step_id: Option<Uuid>,
    status: String,
    resume_at: Option<DateTime<Utc>>,
    attempts: i32,
    last_error: Option<String>,
    trigger_payload: Value,
    history: Value,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl EnrollmentRow {
    fn into_enrollment(self) -> Result<Enrollment, StoreError> {
        let status = EnrollmentStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("enrollment status {:?}", self.status)))?;
        let history: Vec<HistoryEntry> = serde_json::from_value(self.history)?;
        Ok(Enrollment {
            id: self.id,
            workflow_id: self.workflow_id,
            workflow_version: self.workflow_version,
            tenant_id: self.tenant_id,
            contact_id: self.contact_id,
            current_step_id: self.current_step_id,
            status,
            resume_at: self.resume_at,
            attempts: self.attempts.max(0) as u32,
            last_error: self.last_error,
            trigger_payload: self.trigger_payload,
            history,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const ENROLLMENT_COLUMNS: &str = "id, workflow_id, workflow_version, tenant_id, contact_id, \
     current_step_id, status, resume_at, attempts, last_error, trigger_payload, history, \
     created_at, updated_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn push_enrollment_filter(qb: &mut QueryBuilder<'_, sqlx::Postgres>, filter: &EnrollmentFilter) {
        if let Some(workflow_id) = filter.workflow_id {
            qb.push(" AND workflow_id = ").push_bind(workflow_id);
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(after) = filter.created_after {
            qb.push(" AND created_at >= ").push_bind(after);
        }
        if let Some(before) = filter.created_before {
            qb.push(" AND created_at <= ").push_bind(before);
        }
    }
}

#[async_trait]
impl AutomationStore for PgStore {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let definition = serde_json::to_value(StoredDefinition::of(workflow))?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO workflows \
                 (id, tenant_id, name, status, version, allow_reentry, definition, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(workflow.id)
        .bind(workflow.tenant_id)
        .bind(&workflow.name)
        .bind(workflow.status.as_str())
        .bind(workflow.version)
        .bind(workflow.allow_reentry)
        .bind(&definition)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO workflow_versions (workflow_id, version, definition) VALUES ($1, $2, $3)",
        )
        .bind(workflow.id)
        .bind(workflow.version)
        .bind(&definition)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let definition = serde_json::to_value(StoredDefinition::of(workflow))?;
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE workflows SET name = $2, status = $3, version = $4, allow_reentry = $5, \
                 definition = $6, updated_at = $7 \
             WHERE id = $1",
        )
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(workflow.status.as_str())
        .bind(workflow.version)
        .bind(workflow.allow_reentry)
        .bind(&definition)
        .bind(workflow.updated_at)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        sqlx::query(
            "INSERT INTO workflow_versions (workflow_id, version, definition) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (workflow_id, version) DO UPDATE SET definition = EXCLUDED.definition",
        )
        .bind(workflow.id)
        .bind(workflow.version)
        .bind(&definition)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        let row = sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(WorkflowRow::into_workflow).transpose()
    }

    async fn get_workflow_version(
        &self,
        id: Uuid,
        version: i32,
    ) -> Result<Option<Workflow>, StoreError> {
        // The head row carries name/status/policy; only the graph is
        // version-pinned.
        let Some(head) = self.get_workflow(id).await? else {
            return Ok(None);
        };
        if head.version == version {
            return Ok(Some(head));
        }
        let row = sqlx::query(
            "SELECT definition FROM workflow_versions WHERE workflow_id = $1 AND version = $2",
        )
        .bind(id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let definition: StoredDefinition = serde_json::from_value(row.try_get("definition")?)?;
        Ok(Some(Workflow {
            version,
            trigger: definition.trigger,
            steps: definition.steps,
            connections: definition.connections,
            ..head
        }))
    }

    async fn list_workflows(&self, tenant_id: Uuid) -> Result<Vec<Workflow>, StoreError> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            "SELECT * FROM workflows WHERE tenant_id = $1 ORDER BY created_at DESC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WorkflowRow::into_workflow).collect()
    }

    async fn list_active_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            "SELECT * FROM workflows WHERE status = 'active'",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WorkflowRow::into_workflow).collect()
    }

    async fn try_insert_enrollment(
        &self,
        enrollment: &Enrollment,
        allow_reentry: bool,
    ) -> Result<bool, StoreError> {
        let open_slot = if allow_reentry { None } else { Some("open") };
        let result = sqlx::query(
            "INSERT INTO enrollments \
                 (id, workflow_id, workflow_version, tenant_id, contact_id, current_step_id, \
                  status, resume_at, attempts, last_error, trigger_payload, history, open_slot, \
                  created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             ON CONFLICT (workflow_id, contact_id, open_slot) DO NOTHING",
        )
        .bind(enrollment.id)
        .bind(enrollment.workflow_id)
        .bind(enrollment.workflow_version)
        .bind(enrollment.tenant_id)
        .bind(enrollment.contact_id)
        .bind(enrollment.current_step_id)
        .bind(enrollment.status.as_str())
        .bind(enrollment.resume_at)
        .bind(enrollment.attempts as i32)
        .bind(&enrollment.last_error)
        .bind(&enrollment.trigger_payload)
        .bind(serde_json::to_value(&enrollment.history)?)
        .bind(open_slot)
        .bind(enrollment.created_at)
        .bind(enrollment.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_enrollment(&self, id: Uuid) -> Result<Option<Enrollment>, StoreError> {
        let row = sqlx::query_as::<_, EnrollmentRow>(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(EnrollmentRow::into_enrollment).transpose()
    }

    async fn save_enrollment(&self, enrollment: &Enrollment) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE enrollments SET \
                 current_step_id = $2, status = $3, resume_at = $4, attempts = $5, \
                 last_error = $6, history = $7, updated_at = $8, \
                 open_slot = CASE WHEN $3::text IN ('active', 'waiting') THEN open_slot ELSE NULL END \
             WHERE id = $1",
        )
        .bind(enrollment.id)
        .bind(enrollment.current_step_id)
        .bind(enrollment.status.as_str())
        .bind(enrollment.resume_at)
        .bind(enrollment.attempts as i32)
        .bind(&enrollment.last_error)
        .bind(serde_json::to_value(&enrollment.history)?)
        .bind(enrollment.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn cancel_enrollment(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE enrollments SET status = 'cancelled', resume_at = NULL, open_slot = NULL, \
                 updated_at = NOW() \
             WHERE id = $1 AND status IN ('active', 'waiting')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_enrollments(
        &self,
        filter: &EnrollmentFilter,
    ) -> Result<Vec<Enrollment>, StoreError> {
        let mut qb = QueryBuilder::new(format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE 1=1"
        ));
        Self::push_enrollment_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);
        let rows: Vec<EnrollmentRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(EnrollmentRow::into_enrollment).collect()
    }

    async fn count_enrollments(&self, filter: &EnrollmentFilter) -> Result<i64, StoreError> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM enrollments WHERE 1=1");
        Self::push_enrollment_filter(&mut qb, filter);
        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count)
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, StoreError> {
        // SKIP LOCKED keeps concurrent scheduler workers from claiming
        // the same rows; the UPDATE flips waiting rows active and clears
        // resume_at so a second pass cannot claim them again.
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "UPDATE enrollments SET status = 'active', resume_at = NULL, updated_at = NOW() \
             WHERE id IN ( \
                 SELECT id FROM enrollments \
                 WHERE resume_at IS NOT NULL AND resume_at <= $1 \
                   AND status IN ('waiting', 'active') \
                 ORDER BY resume_at \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING id",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn record_stat(
        &self,
        workflow_id: Uuid,
        enrollment_id: Uuid,
        kind: StatKind,
    ) -> Result<bool, StoreError> {
        // Ledger insert and counter bump in one statement: if the ledger
        // row already exists, the CTE is empty and nothing is counted.
        let result = sqlx::query(
            "WITH ledger AS ( \
                 INSERT INTO workflow_stat_entries (enrollment_id, kind, workflow_id) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT DO NOTHING \
                 RETURNING 1 \
             ) \
             INSERT INTO workflow_stats (workflow_id, triggered, completed, failed) \
             SELECT $3, \
                    CASE WHEN $2 = 'triggered' THEN 1 ELSE 0 END, \
                    CASE WHEN $2 = 'completed' THEN 1 ELSE 0 END, \
                    CASE WHEN $2 = 'failed' THEN 1 ELSE 0 END \
             FROM ledger \
             ON CONFLICT (workflow_id) DO UPDATE SET \
                 triggered = workflow_stats.triggered + EXCLUDED.triggered, \
                 completed = workflow_stats.completed + EXCLUDED.completed, \
                 failed = workflow_stats.failed + EXCLUDED.failed",
        )
        .bind(enrollment_id)
        .bind(kind.as_str())
        .bind(workflow_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn workflow_stats(&self, workflow_id: Uuid) -> Result<WorkflowStats, StoreError> {
        let row = sqlx::query(
            "SELECT triggered, completed, failed FROM workflow_stats WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(WorkflowStats {
                workflow_id,
                triggered: row.try_get("triggered")?,
                completed: row.try_get("completed")?,
                failed: row.try_get("failed")?,
            }),
            None => Ok(WorkflowStats::empty(workflow_id)),
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    workflows: HashMap<Uuid, Workflow>,
    versions: HashMap<(Uuid, i32), Workflow>,
    enrollments: HashMap<Uuid, Enrollment>,
    // (workflow, contact) pairs holding the single open slot under the
    // default re-entry policy.
    open_slots: HashSet<(Uuid, Uuid)>,
    stats: HashMap<Uuid, WorkflowStats>,
    stat_ledger: HashSet<(Uuid, StatKind)>,
}

/// In-memory store with the same claim and re-entry atomicity as
/// `PgStore`, a single mutex standing in for the row locks.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn matches_filter(enrollment: &Enrollment, filter: &EnrollmentFilter) -> bool {
    if filter.workflow_id.is_some_and(|id| enrollment.workflow_id != id) {
        return false;
    }
    if filter.status.is_some_and(|s| enrollment.status != s) {
        return false;
    }
    if filter.created_after.is_some_and(|t| enrollment.created_at < t) {
        return false;
    }
    if filter.created_before.is_some_and(|t| enrollment.created_at > t) {
        return false;
    }
    true
}

#[async_trait]
impl AutomationStore for MemoryStore {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner
            .versions
            .insert((workflow.id, workflow.version), workflow.clone());
        inner.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.workflows.contains_key(&workflow.id) {
            return Err(StoreError::NotFound);
        }
        inner
            .versions
            .insert((workflow.id, workflow.version), workflow.clone());
        inner.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        Ok(self.lock().workflows.get(&id).cloned())
    }

    async fn get_workflow_version(
        &self,
        id: Uuid,
        version: i32,
    ) -> Result<Option<Workflow>, StoreError> {
        let inner = self.lock();
        let Some(head) = inner.workflows.get(&id) else {
            return Ok(None);
        };
        let Some(pinned) = inner.versions.get(&(id, version)) else {
            return Ok(None);
        };
        Ok(Some(Workflow {
            version,
            trigger: pinned.trigger.clone(),
            steps: pinned.steps.clone(),
            connections: pinned.connections.clone(),
            ..head.clone()
        }))
    }

    async fn list_workflows(&self, tenant_id: Uuid) -> Result<Vec<Workflow>, StoreError> {
        let mut workflows: Vec<Workflow> = self
            .lock()
            .workflows
            .values()
            .filter(|w| w.tenant_id == tenant_id)
            .cloned()
            .collect();
        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(workflows)
    }

    async fn list_active_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        Ok(self
            .lock()
            .workflows
            .values()
            .filter(|w| w.status == WorkflowStatus::Active)
            .cloned()
            .collect())
    }

    async fn try_insert_enrollment(
        &self,
        enrollment: &Enrollment,
        allow_reentry: bool,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let slot = (enrollment.workflow_id, enrollment.contact_id);
        if !allow_reentry {
            if inner.open_slots.contains(&slot) {
                return Ok(false);
            }
            inner.open_slots.insert(slot);
        }
        inner.enrollments.insert(enrollment.id, enrollment.clone());
        Ok(true)
    }

    async fn get_enrollment(&self, id: Uuid) -> Result<Option<Enrollment>, StoreError> {
        Ok(self.lock().enrollments.get(&id).cloned())
    }

    async fn save_enrollment(&self, enrollment: &Enrollment) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.enrollments.contains_key(&enrollment.id) {
            return Err(StoreError::NotFound);
        }
        if enrollment.status.is_terminal() {
            inner
                .open_slots
                .remove(&(enrollment.workflow_id, enrollment.contact_id));
        }
        inner.enrollments.insert(enrollment.id, enrollment.clone());
        Ok(())
    }

    async fn cancel_enrollment(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let Some(enrollment) = inner.enrollments.get_mut(&id) else {
            return Ok(false);
        };
        if enrollment.status.is_terminal() {
            return Ok(false);
        }
        enrollment.status = EnrollmentStatus::Cancelled;
        enrollment.resume_at = None;
        enrollment.updated_at = Some(Utc::now());
        let slot = (enrollment.workflow_id, enrollment.contact_id);
        inner.open_slots.remove(&slot);
        Ok(true)
    }

    async fn list_enrollments(
        &self,
        filter: &EnrollmentFilter,
    ) -> Result<Vec<Enrollment>, StoreError> {
        let mut matching: Vec<Enrollment> = self
            .lock()
            .enrollments
            .values()
            .filter(|e| matches_filter(e, filter))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn count_enrollments(&self, filter: &EnrollmentFilter) -> Result<i64, StoreError> {
        Ok(self
            .lock()
            .enrollments
            .values()
            .filter(|e| matches_filter(e, filter))
            .count() as i64)
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, StoreError> {
        let mut inner = self.lock();
        let mut due: Vec<(DateTime<Utc>, Uuid)> = inner
            .enrollments
            .values()
            .filter(|e| {
                matches!(
                    e.status,
                    EnrollmentStatus::Waiting | EnrollmentStatus::Active
                ) && e.resume_at.is_some_and(|at| at <= now)
            })
            .map(|e| (e.resume_at.unwrap_or(now), e.id))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(enrollment) = inner.enrollments.get_mut(&id) {
                enrollment.status = EnrollmentStatus::Active;
                enrollment.resume_at = None;
                enrollment.updated_at = Some(Utc::now());
                claimed.push(id);
            }
        }
        Ok(claimed)
    }

    async fn record_stat(
        &self,
        workflow_id: Uuid,
        enrollment_id: Uuid,
        kind: StatKind,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        if !inner.stat_ledger.insert((enrollment_id, kind)) {
            return Ok(false);
        }
        let stats = inner
            .stats
            .entry(workflow_id)
            .or_insert_with(|| WorkflowStats::empty(workflow_id));
        match kind {
            StatKind::Triggered => stats.triggered += 1,
            StatKind::Completed => stats.completed += 1,
            StatKind::Failed => stats.failed += 1,
        }
        Ok(true)
    }

    async fn workflow_stats(&self, workflow_id: Uuid) -> Result<WorkflowStats, StoreError> {
        Ok(self
            .lock()
            .stats
            .get(&workflow_id)
            .cloned()
            .unwrap_or_else(|| WorkflowStats::empty(workflow_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::triggers::{TriggerSpec, TriggerType};
    use serde_json::Value;

    fn workflow() -> Workflow {
        let mut wf = Workflow::new(
            Uuid::new_v4(),
            "wf",
            TriggerSpec::on(TriggerType::ContactCreated),
        );
        wf.status = WorkflowStatus::Active;
        wf
    }

    #[tokio::test]
    async fn test_reentry_guard_admits_one_open_enrollment() {
        let store = MemoryStore::new();
        let wf = workflow();
        store.insert_workflow(&wf).await.unwrap();
        let contact = Uuid::new_v4();

        let first = Enrollment::new(&wf, contact, Value::Null);
        let second = Enrollment::new(&wf, contact, Value::Null);
        assert!(store.try_insert_enrollment(&first, false).await.unwrap());
        assert!(!store.try_insert_enrollment(&second, false).await.unwrap());

        // Terminal save releases the slot.
        let mut done = first.clone();
        done.status = EnrollmentStatus::Completed;
        store.save_enrollment(&done).await.unwrap();
        assert!(store.try_insert_enrollment(&second, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_allow_reentry_skips_the_guard() {
        let store = MemoryStore::new();
        let wf = workflow();
        store.insert_workflow(&wf).await.unwrap();
        let contact = Uuid::new_v4();

        let first = Enrollment::new(&wf, contact, Value::Null);
        let second = Enrollment::new(&wf, contact, Value::Null);
        assert!(store.try_insert_enrollment(&first, true).await.unwrap());
        assert!(store.try_insert_enrollment(&second, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_due_is_exclusive_and_clears_resume_at() {
        let store = MemoryStore::new();
        let wf = workflow();
        store.insert_workflow(&wf).await.unwrap();

        let mut e = Enrollment::new(&wf, Uuid::new_v4(), Value::Null);
        e.status = EnrollmentStatus::Waiting;
        e.resume_at = Some(Utc::now() - chrono::Duration::minutes(1));
        store.try_insert_enrollment(&e, false).await.unwrap();

        let first = store.claim_due(Utc::now(), 10).await.unwrap();
        assert_eq!(first, vec![e.id]);
        let second = store.claim_due(Utc::now(), 10).await.unwrap();
        assert!(second.is_empty());

        let claimed = store.get_enrollment(e.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, EnrollmentStatus::Active);
        assert!(claimed.resume_at.is_none());
    }

    #[tokio::test]
    async fn test_claim_due_ignores_future_resumes() {
        let store = MemoryStore::new();
        let wf = workflow();
        store.insert_workflow(&wf).await.unwrap();

        let mut e = Enrollment::new(&wf, Uuid::new_v4(), Value::Null);
        e.status = EnrollmentStatus::Waiting;
        e.resume_at = Some(Utc::now() + chrono::Duration::hours(1));
        store.try_insert_enrollment(&e, false).await.unwrap();

        assert!(store.claim_due(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_version_pinning_survives_edits() {
        let store = MemoryStore::new();
        let mut wf = workflow();
        store.insert_workflow(&wf).await.unwrap();

        let original_steps = wf.steps.len();
        wf.version += 1;
        wf.steps.push(crate::automation::definition::Step::new(
            "Added later",
            crate::automation::definition::StepConfig::Trigger,
        ));
        store.update_workflow(&wf).await.unwrap();

        let pinned = store.get_workflow_version(wf.id, 1).await.unwrap().unwrap();
        assert_eq!(pinned.steps.len(), original_steps);
        assert_eq!(pinned.version, 1);
        let head = store.get_workflow(wf.id).await.unwrap().unwrap();
        assert_eq!(head.version, 2);
    }

    #[tokio::test]
    async fn test_cancel_only_touches_open_enrollments() {
        let store = MemoryStore::new();
        let wf = workflow();
        store.insert_workflow(&wf).await.unwrap();
        let e = Enrollment::new(&wf, Uuid::new_v4(), Value::Null);
        store.try_insert_enrollment(&e, false).await.unwrap();

        assert!(store.cancel_enrollment(e.id).await.unwrap());
        // Already terminal: second cancel is a no-op.
        assert!(!store.cancel_enrollment(e.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_stat_ledger_is_idempotent() {
        let store = MemoryStore::new();
        let wf_id = Uuid::new_v4();
        let enrollment_id = Uuid::new_v4();

        assert!(store
            .record_stat(wf_id, enrollment_id, StatKind::Completed)
            .await
            .unwrap());
        assert!(!store
            .record_stat(wf_id, enrollment_id, StatKind::Completed)
            .await
            .unwrap());

        let stats = store.workflow_stats(wf_id).await.unwrap();
        assert_eq!(stats.completed, 1);
    }
}
