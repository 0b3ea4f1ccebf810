// Workflow Definitions - step graph model and structural validation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use uuid::Uuid;

use super::actions::ActionConfig;
use super::conditions::ConditionGroup;
use super::triggers::TriggerSpec;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WaitUnit {
    Minutes,
    Hours,
    Days,
}

/// Wait step parameters. Durations are persisted, never slept on in-process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaitConfig {
    pub duration: i64,
    pub unit: WaitUnit,
}

impl WaitConfig {
    pub fn interval(&self) -> chrono::Duration {
        match self.unit {
            WaitUnit::Minutes => chrono::Duration::minutes(self.duration),
            WaitUnit::Hours => chrono::Duration::hours(self.duration),
            WaitUnit::Days => chrono::Duration::days(self.duration),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionStep {
    pub expression: ConditionGroup,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GoalStep {
    pub expression: ConditionGroup,
}

/// Type-specific step parameters. Tagged so each handler receives a
/// statically known shape instead of an untyped map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    Trigger,
    Condition(ConditionStep),
    Action(ActionConfig),
    Wait(WaitConfig),
    Goal(GoalStep),
}

impl StepConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Condition(_) => "condition",
            Self::Action(_) => "action",
            Self::Wait(_) => "wait",
            Self::Goal(_) => "goal",
        }
    }
}

/// A single node in a workflow graph. Owned exclusively by its workflow
/// and referenced by id, never by pointer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: Uuid,
    pub name: String,
    pub config: StepConfig,
}

impl Step {
    pub fn new(name: &str, config: StepConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            config,
        }
    }

    pub fn is_entry(&self) -> bool {
        matches!(self.config, StepConfig::Trigger)
    }
}

/// Directed edge between two steps. `branch` labels the edge for condition
/// outcomes ("true"/"false"); `None` is the default/unconditional edge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    pub from_step_id: Uuid,
    pub to_step_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl Connection {
    pub fn new(from: Uuid, to: Uuid) -> Self {
        Self {
            from_step_id: from,
            to_step_id: to,
            branch: None,
        }
    }

    pub fn branch(from: Uuid, to: Uuid, label: &str) -> Self {
        Self {
            from_step_id: from,
            to_step_id: to,
            branch: Some(label.to_string()),
        }
    }
}

/// Structural errors surfaced to workflow authors at activation time.
/// Activation gating guarantees none of these can occur mid-execution.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("workflow has no trigger step")]
    MissingEntry,
    #[error("workflow has {0} trigger steps, expected exactly one")]
    MultipleEntry(usize),
    #[error("duplicate step id {0}")]
    DuplicateStep(Uuid),
    #[error("connection references unknown step ({from} -> {to})")]
    DanglingEdge { from: Uuid, to: Uuid },
    #[error("step {0} is not reachable from the trigger step")]
    Unreachable(Uuid),
    #[error("step {0} has ambiguous outgoing connections")]
    AmbiguousBranch(Uuid),
    #[error("cycle through step {0} does not pass through a wait step")]
    CycleWithoutWait(Uuid),
    #[error("wait step {0} must have a positive duration")]
    InvalidWaitDuration(Uuid),
    #[error("workflow is {0} and cannot be activated")]
    NotActivatable(&'static str),
}

/// Tenant-authored automation graph. Immutable per version: a structural
/// edit bumps `version` and in-flight enrollments keep the version they
/// were created against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub status: WorkflowStatus,
    pub version: i32,
    pub trigger: TriggerSpec,
    pub steps: Vec<Step>,
    pub connections: Vec<Connection>,
    /// When true, a contact may be enrolled again while a previous
    /// enrollment is still open. Default is the skip policy.
    pub allow_reentry: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(tenant_id: Uuid, name: &str, trigger: TriggerSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            status: WorkflowStatus::Draft,
            version: 1,
            trigger,
            steps: Vec::new(),
            connections: Vec::new(),
            allow_reentry: false,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    pub fn step(&self, id: Uuid) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn entry_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.is_entry())
    }

    pub fn outgoing(&self, step_id: Uuid) -> Vec<&Connection> {
        self.connections
            .iter()
            .filter(|c| c.from_step_id == step_id)
            .collect()
    }

    /// The unconditional edge leaving `step_id`, if any.
    pub fn default_edge(&self, step_id: Uuid) -> Option<&Connection> {
        self.connections
            .iter()
            .find(|c| c.from_step_id == step_id && c.branch.is_none())
    }

    pub fn branch_edge(&self, step_id: Uuid, label: &str) -> Option<&Connection> {
        self.connections
            .iter()
            .find(|c| c.from_step_id == step_id && c.branch.as_deref() == Some(label))
    }

    /// First executable step: the target of the trigger step's outgoing
    /// edge. New enrollments start here.
    pub fn first_step(&self) -> Option<Uuid> {
        let entry = self.entry_step()?;
        self.default_edge(entry.id).map(|c| c.to_step_id)
    }

    /// Structural validation. Collects every problem rather than stopping
    /// at the first so the author sees the full picture.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id) {
                errors.push(ValidationError::DuplicateStep(step.id));
            }
        }

        // A zero or negative wait would resume in the past and turn any
        // legal cycle into a hot loop at scheduler poll frequency.
        for step in &self.steps {
            if let StepConfig::Wait(wait) = &step.config {
                if wait.duration < 1 {
                    errors.push(ValidationError::InvalidWaitDuration(step.id));
                }
            }
        }

        let entries: Vec<&Step> = self.steps.iter().filter(|s| s.is_entry()).collect();
        match entries.len() {
            0 => errors.push(ValidationError::MissingEntry),
            1 => {}
            n => errors.push(ValidationError::MultipleEntry(n)),
        }

        let ids: HashSet<Uuid> = self.steps.iter().map(|s| s.id).collect();
        for conn in &self.connections {
            if !ids.contains(&conn.from_step_id) || !ids.contains(&conn.to_step_id) {
                errors.push(ValidationError::DanglingEdge {
                    from: conn.from_step_id,
                    to: conn.to_step_id,
                });
            }
        }

        // Determinism: a plain step has at most one unconditional edge out,
        // and a condition step never declares the same branch twice.
        for step in &self.steps {
            let out = self.outgoing(step.id);
            let unconditional = out.iter().filter(|c| c.branch.is_none()).count();
            match step.config {
                StepConfig::Condition(_) => {
                    let mut labels = HashSet::new();
                    let mut ambiguous = unconditional > 1;
                    for conn in &out {
                        if let Some(label) = &conn.branch {
                            if !labels.insert(label.as_str()) {
                                ambiguous = true;
                            }
                        }
                    }
                    if ambiguous {
                        errors.push(ValidationError::AmbiguousBranch(step.id));
                    }
                }
                _ => {
                    if unconditional > 1 || out.len() > unconditional {
                        errors.push(ValidationError::AmbiguousBranch(step.id));
                    }
                }
            }
        }

        if let Some(entry) = entries.first() {
            for unreachable in self.unreachable_from(entry.id) {
                errors.push(ValidationError::Unreachable(unreachable));
            }
        }

        errors.extend(self.cycles_without_wait());

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Validate and move to `active`. Archived workflows are terminal.
    pub fn activate(&mut self) -> Result<(), Vec<ValidationError>> {
        if self.status == WorkflowStatus::Archived {
            return Err(vec![ValidationError::NotActivatable("archived")]);
        }
        self.validate()?;
        self.status = WorkflowStatus::Active;
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    pub fn pause(&mut self) {
        if self.status == WorkflowStatus::Active {
            self.status = WorkflowStatus::Paused;
            self.updated_at = Some(Utc::now());
        }
    }

    /// Terminal: disables new enrollments. Runs already in flight are
    /// cancelled lazily when the scheduler next touches them.
    pub fn archive(&mut self) {
        self.status = WorkflowStatus::Archived;
        self.updated_at = Some(Utc::now());
    }

    fn adjacency(&self) -> HashMap<Uuid, Vec<Uuid>> {
        let ids: HashSet<Uuid> = self.steps.iter().map(|s| s.id).collect();
        let mut adj: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for conn in &self.connections {
            if ids.contains(&conn.from_step_id) && ids.contains(&conn.to_step_id) {
                adj.entry(conn.from_step_id).or_default().push(conn.to_step_id);
            }
        }
        adj
    }

    fn unreachable_from(&self, entry: Uuid) -> Vec<Uuid> {
        let adj = self.adjacency();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([entry]);
        while let Some(id) = queue.pop_front() {
            if visited.insert(id) {
                if let Some(next) = adj.get(&id) {
                    queue.extend(next.iter().copied());
                }
            }
        }
        self.steps
            .iter()
            .map(|s| s.id)
            .filter(|id| !visited.contains(id))
            .collect()
    }

    /// Cycle detection over the graph with wait steps removed. A loop is
    /// legal only if every trip around it suspends on a wait.
    fn cycles_without_wait(&self) -> Vec<ValidationError> {
        let waits: HashSet<Uuid> = self
            .steps
            .iter()
            .filter(|s| matches!(s.config, StepConfig::Wait(_)))
            .map(|s| s.id)
            .collect();
        let adj = self.adjacency();

        // DFS coloring: 0 unvisited, 1 on stack, 2 done.
        let mut color: HashMap<Uuid, u8> = HashMap::new();
        let mut errors = Vec::new();

        fn visit(
            node: Uuid,
            adj: &HashMap<Uuid, Vec<Uuid>>,
            waits: &HashSet<Uuid>,
            color: &mut HashMap<Uuid, u8>,
            errors: &mut Vec<ValidationError>,
        ) {
            color.insert(node, 1);
            for &next in adj.get(&node).map(Vec::as_slice).unwrap_or(&[]) {
                if waits.contains(&next) {
                    continue;
                }
                match color.get(&next).copied().unwrap_or(0) {
                    0 => visit(next, adj, waits, color, errors),
                    1 => errors.push(ValidationError::CycleWithoutWait(next)),
                    _ => {}
                }
            }
            color.insert(node, 2);
        }

        for step in &self.steps {
            if waits.contains(&step.id) {
                continue;
            }
            if color.get(&step.id).copied().unwrap_or(0) == 0 {
                visit(step.id, &adj, &waits, &mut color, &mut errors);
            }
        }
        errors
    }
}
