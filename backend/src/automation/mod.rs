// Automation Workflow Engine
//
// Event-driven contact automation for the Nurture marketing platform.
// A workflow is a tenant-authored graph of trigger, condition, action,
// wait and goal steps; enrollments walk one contact through one pinned
// version of that graph, suspending durably on waits.

pub mod actions;
pub mod analytics;
pub mod conditions;
pub mod definition;
pub mod engine;
pub mod store;
pub mod triggers;

pub use actions::{ActionConfig, ActionDispatcher, ActionKind, ActionOutcome};
pub use analytics::{StatKind, StatsAggregator, WorkflowStats};
pub use conditions::{Condition, ConditionGroup, ConditionOperator, EvalContext};
pub use definition::{
    ConditionStep, Connection, GoalStep, Step, StepConfig, ValidationError, WaitConfig, WaitUnit,
    Workflow, WorkflowStatus,
};
pub use engine::{
    Enrollment, EnrollmentEngine, EnrollmentStatus, EngineError, HistoryEntry, RetryPolicy,
    StepOutcome,
};
pub use store::{AutomationStore, EnrollmentFilter, MemoryStore, PgStore, StoreError};
pub use triggers::{
    DomainEvent, EnrollmentBatch, TriggerDispatcher, TriggerSpec, TriggerType,
};
