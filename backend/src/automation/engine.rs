// Enrollment Engine - per-contact state machine over a workflow graph
//
// One call to `advance` performs exactly one step transition. The `run`
// driver loops while the enrollment stays active for the current tick;
// wait steps persist `resume_at` and suspend instead of sleeping, so no
// invocation ever blocks on user-supplied durations.

use chrono::{DateTime, Utc};
use nurture_shared::ContactSnapshot;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::actions::{ActionDispatcher, ActionOutcome, DispatchContext};
use super::analytics::StatsAggregator;
use super::conditions::{self, BRANCH_TRUE};
use super::definition::{StepConfig, Workflow, WorkflowStatus};
use super::store::{AutomationStore, StoreError};
use crate::capabilities::Capabilities;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl EnrollmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "waiting" => Some(Self::Waiting),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// What happened when the engine visited a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    ActionDelivered,
    ActionDeferred,
    ActionRetried { attempt: u32, error: String },
    ActionFailed { error: String },
    BranchTaken { branch: String },
    DeadEnd,
    WaitScheduled { resume_at: DateTime<Utc> },
    GoalMet,
    GoalNotMet,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub step_id: Uuid,
    pub entered_at: DateTime<Utc>,
    pub exited_at: DateTime<Utc>,
    pub outcome: StepOutcome,
}

/// One contact's traversal of one pinned workflow version. Mutated only
/// by the engine; never deleted; `history` is append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: i32,
    pub tenant_id: Uuid,
    pub contact_id: Uuid,
    /// The step the engine will execute next. While `waiting`, this is
    /// already the post-wait step so a resume picks up where the wait
    /// pointed.
    pub current_step_id: Option<Uuid>,
    pub status: EnrollmentStatus,
    pub resume_at: Option<DateTime<Utc>>,
    /// Consecutive failed attempts of the current action step.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub trigger_payload: Value,
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Enrollment {
    pub fn new(workflow: &Workflow, contact_id: Uuid, trigger_payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            workflow_version: workflow.version,
            tenant_id: workflow.tenant_id,
            contact_id,
            current_step_id: workflow.first_step(),
            status: EnrollmentStatus::Active,
            resume_at: None,
            attempts: 0,
            last_error: None,
            trigger_payload,
            history: Vec::new(),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn record(&mut self, step_id: Uuid, entered_at: DateTime<Utc>, outcome: StepOutcome) {
        self.history.push(HistoryEntry {
            step_id,
            entered_at,
            exited_at: Utc::now(),
            outcome,
        });
        self.updated_at = Some(Utc::now());
    }
}

/// Exponential backoff for failed action dispatches.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 60,
            max_delay_secs: 3600,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling per attempt with up to
    /// 25% jitter so retry storms spread out.
    pub fn backoff(&self, attempt: u32) -> chrono::Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let exp = self.base_delay_secs.saturating_mul(1u64 << shift);
        let capped = exp.min(self.max_delay_secs);
        let jitter = rand::thread_rng().gen_range(0..=capped / 4);
        chrono::Duration::seconds((capped + jitter) as i64)
    }
}

/// Result of a single `advance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The enrollment moved to the next step and can run again now.
    Continue,
    /// The enrollment is parked (wait or retry backoff); the scheduler
    /// owns resumption.
    Suspended,
    /// The enrollment reached a terminal status.
    Terminal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("enrollment {0} not found")]
    EnrollmentMissing(Uuid),
    #[error("workflow {0} not found")]
    WorkflowMissing(Uuid),
    #[error("workflow {0} is not active")]
    WorkflowNotActive(Uuid),
    #[error("workflow {workflow_id} version {version} not found")]
    VersionMissing { workflow_id: Uuid, version: i32 },
    #[error("enrollment {enrollment} references unknown step {step}")]
    StepMissing { enrollment: Uuid, step: Uuid },
}

pub struct EnrollmentEngine {
    store: Arc<dyn AutomationStore>,
    capabilities: Arc<dyn Capabilities>,
    dispatcher: ActionDispatcher,
    retry: RetryPolicy,
    stats: StatsAggregator,
}

impl EnrollmentEngine {
    pub fn new(
        store: Arc<dyn AutomationStore>,
        capabilities: Arc<dyn Capabilities>,
        dispatcher: ActionDispatcher,
        retry: RetryPolicy,
        stats: StatsAggregator,
    ) -> Self {
        Self {
            store,
            capabilities,
            dispatcher,
            retry,
            stats,
        }
    }

    /// Drive one enrollment until it suspends or terminates. Persists the
    /// enrollment after every step transition so a crash never loses a
    /// recorded outcome.
    pub async fn run(&self, enrollment_id: Uuid) -> Result<Enrollment, EngineError> {
        let mut enrollment = self
            .store
            .get_enrollment(enrollment_id)
            .await?
            .ok_or(EngineError::EnrollmentMissing(enrollment_id))?;

        if enrollment.status.is_terminal() {
            return Ok(enrollment);
        }

        let current = self
            .store
            .get_workflow(enrollment.workflow_id)
            .await?
            .ok_or(EngineError::WorkflowMissing(enrollment.workflow_id))?;

        // Archival cancels in-flight runs cooperatively, at the next time
        // the engine looks at them.
        if current.status == WorkflowStatus::Archived {
            return self.cancel_for_archival(enrollment).await;
        }

        let workflow = self
            .store
            .get_workflow_version(enrollment.workflow_id, enrollment.workflow_version)
            .await?
            .ok_or(EngineError::VersionMissing {
                workflow_id: enrollment.workflow_id,
                version: enrollment.workflow_version,
            })?;

        loop {
            let advance = self.advance(&mut enrollment, &workflow).await?;
            self.store.save_enrollment(&enrollment).await?;
            match advance {
                Advance::Continue => continue,
                Advance::Suspended => break,
                Advance::Terminal => {
                    info!(
                        enrollment = %enrollment.id,
                        workflow = %enrollment.workflow_id,
                        status = enrollment.status.as_str(),
                        "enrollment reached terminal state"
                    );
                    self.stats.record_terminal(&enrollment).await?;
                    break;
                }
            }
        }

        Ok(enrollment)
    }

    /// Execute exactly one step transition.
    pub async fn advance(
        &self,
        enrollment: &mut Enrollment,
        workflow: &Workflow,
    ) -> Result<Advance, EngineError> {
        match enrollment.status {
            EnrollmentStatus::Active => {}
            EnrollmentStatus::Waiting => return Ok(Advance::Suspended),
            _ => return Ok(Advance::Terminal),
        }

        let Some(step_id) = enrollment.current_step_id else {
            Self::complete(enrollment);
            return Ok(Advance::Terminal);
        };
        let step = workflow.step(step_id).ok_or(EngineError::StepMissing {
            enrollment: enrollment.id,
            step: step_id,
        })?;
        let entered_at = Utc::now();

        match &step.config {
            StepConfig::Trigger => Ok(Self::follow_default(enrollment, workflow, step_id)),

            StepConfig::Action(action) => {
                let contact = self.snapshot(enrollment).await;
                let ctx = DispatchContext {
                    tenant_id: enrollment.tenant_id,
                    contact: &contact,
                    trigger_payload: &enrollment.trigger_payload,
                };
                match self.dispatcher.dispatch(action, &ctx).await {
                    ActionOutcome::Delivered => {
                        enrollment.attempts = 0;
                        enrollment.record(step_id, entered_at, StepOutcome::ActionDelivered);
                        Ok(Self::follow_default(enrollment, workflow, step_id))
                    }
                    ActionOutcome::Deferred => {
                        enrollment.attempts = 0;
                        enrollment.record(step_id, entered_at, StepOutcome::ActionDeferred);
                        Ok(Self::follow_default(enrollment, workflow, step_id))
                    }
                    ActionOutcome::Failed { reason } => {
                        let max = action.max_attempts.unwrap_or(self.retry.max_attempts);
                        enrollment.attempts += 1;
                        if enrollment.attempts >= max {
                            warn!(
                                enrollment = %enrollment.id,
                                step = %step_id,
                                attempts = enrollment.attempts,
                                "action failed, retry budget exhausted"
                            );
                            enrollment.record(
                                step_id,
                                entered_at,
                                StepOutcome::ActionFailed {
                                    error: reason.clone(),
                                },
                            );
                            enrollment.last_error = Some(reason);
                            Self::fail(enrollment);
                            Ok(Advance::Terminal)
                        } else {
                            let delay = self.retry.backoff(enrollment.attempts);
                            warn!(
                                enrollment = %enrollment.id,
                                step = %step_id,
                                attempt = enrollment.attempts,
                                retry_in_secs = delay.num_seconds(),
                                "action failed, scheduling retry"
                            );
                            enrollment.record(
                                step_id,
                                entered_at,
                                StepOutcome::ActionRetried {
                                    attempt: enrollment.attempts,
                                    error: reason.clone(),
                                },
                            );
                            enrollment.last_error = Some(reason);
                            // Stays active: the scheduler re-queues it when
                            // the backoff elapses.
                            enrollment.resume_at = Some(Utc::now() + delay);
                            Ok(Advance::Suspended)
                        }
                    }
                }
            }

            StepConfig::Condition(cond) => {
                let contact = self.snapshot(enrollment).await;
                let ctx = conditions::EvalContext::new(&contact, &enrollment.trigger_payload);
                let branch = conditions::evaluate(&cond.expression, &ctx);
                let edge = workflow
                    .branch_edge(step_id, branch)
                    .or_else(|| workflow.default_edge(step_id));
                match edge {
                    Some(conn) => {
                        let target = conn.to_step_id;
                        enrollment.record(
                            step_id,
                            entered_at,
                            StepOutcome::BranchTaken {
                                branch: branch.to_string(),
                            },
                        );
                        enrollment.current_step_id = Some(target);
                        Ok(Advance::Continue)
                    }
                    None => {
                        // Unmatched branch is a normal exit, not an error.
                        enrollment.record(step_id, entered_at, StepOutcome::DeadEnd);
                        Self::complete(enrollment);
                        Ok(Advance::Terminal)
                    }
                }
            }

            StepConfig::Wait(wait) => {
                let resume_at = Utc::now() + wait.interval();
                enrollment.record(step_id, entered_at, StepOutcome::WaitScheduled { resume_at });
                // Point at the post-wait step now; the scheduler resume
                // continues from there (or completes if nothing follows).
                enrollment.current_step_id =
                    workflow.default_edge(step_id).map(|c| c.to_step_id);
                enrollment.status = EnrollmentStatus::Waiting;
                enrollment.resume_at = Some(resume_at);
                Ok(Advance::Suspended)
            }

            StepConfig::Goal(goal) => {
                let contact = self.snapshot(enrollment).await;
                let ctx = conditions::EvalContext::new(&contact, &enrollment.trigger_payload);
                if conditions::evaluate(&goal.expression, &ctx) == BRANCH_TRUE {
                    // Goal short-circuits the rest of the graph for this
                    // enrollment only.
                    enrollment.record(step_id, entered_at, StepOutcome::GoalMet);
                    Self::complete(enrollment);
                    Ok(Advance::Terminal)
                } else {
                    enrollment.record(step_id, entered_at, StepOutcome::GoalNotMet);
                    Ok(Self::follow_default(enrollment, workflow, step_id))
                }
            }
        }
    }

    async fn cancel_for_archival(
        &self,
        mut enrollment: Enrollment,
    ) -> Result<Enrollment, EngineError> {
        info!(
            enrollment = %enrollment.id,
            workflow = %enrollment.workflow_id,
            "workflow archived, cancelling enrollment"
        );
        if let Some(step_id) = enrollment.current_step_id {
            enrollment.record(step_id, Utc::now(), StepOutcome::Cancelled);
        }
        enrollment.status = EnrollmentStatus::Cancelled;
        enrollment.resume_at = None;
        enrollment.updated_at = Some(Utc::now());
        self.store.save_enrollment(&enrollment).await?;
        Ok(enrollment)
    }

    /// Fetch the contact's current state. A fetch failure degrades to an
    /// empty snapshot so conditions take the absent-value branch instead
    /// of killing the enrollment.
    async fn snapshot(&self, enrollment: &Enrollment) -> ContactSnapshot {
        match self
            .capabilities
            .contact_snapshot(enrollment.tenant_id, enrollment.contact_id)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    enrollment = %enrollment.id,
                    contact = %enrollment.contact_id,
                    error = %e,
                    "contact snapshot unavailable, evaluating against empty state"
                );
                ContactSnapshot::unresolved(enrollment.tenant_id, enrollment.contact_id)
            }
        }
    }

    fn follow_default(enrollment: &mut Enrollment, workflow: &Workflow, step_id: Uuid) -> Advance {
        match workflow.default_edge(step_id) {
            Some(conn) => {
                enrollment.current_step_id = Some(conn.to_step_id);
                Advance::Continue
            }
            None => {
                Self::complete(enrollment);
                Advance::Terminal
            }
        }
    }

    fn complete(enrollment: &mut Enrollment) {
        enrollment.status = EnrollmentStatus::Completed;
        enrollment.resume_at = None;
        enrollment.updated_at = Some(Utc::now());
    }

    fn fail(enrollment: &mut Enrollment) {
        enrollment.status = EnrollmentStatus::Failed;
        enrollment.resume_at = None;
        enrollment.updated_at = Some(Utc::now());
    }
}
