// Condition Evaluation - pure branch selection over contact state
//
// Evaluation never performs I/O and never mutates its context, so the
// engine is free to retry or re-run it. An absent attribute is a normal
// falsy outcome, not an error: enrollments must not die on missing data.

use nurture_shared::ContactSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const BRANCH_TRUE: &str = "true";
pub const BRANCH_FALSE: &str = "false";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    HasTag,
    NotHasTag,
    IsSet,
    NotSet,
}

/// A single comparison against the enrollment context. `field` supports
/// dot notation; `contact.` reads contact attributes, `event.` reads the
/// original trigger payload, bare names try the payload first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: &str, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
        }
    }

    pub fn equals(field: &str, value: Value) -> Self {
        Self::new(field, ConditionOperator::Equals, value)
    }

    pub fn not_equals(field: &str, value: Value) -> Self {
        Self::new(field, ConditionOperator::NotEquals, value)
    }

    pub fn contains(field: &str, value: &str) -> Self {
        Self::new(field, ConditionOperator::Contains, Value::String(value.to_string()))
    }

    pub fn greater_than(field: &str, value: f64) -> Self {
        Self::new(field, ConditionOperator::GreaterThan, serde_json::json!(value))
    }

    pub fn less_than(field: &str, value: f64) -> Self {
        Self::new(field, ConditionOperator::LessThan, serde_json::json!(value))
    }

    pub fn has_tag(tag: &str) -> Self {
        Self::new("tags", ConditionOperator::HasTag, Value::String(tag.to_string()))
    }

    pub fn not_has_tag(tag: &str) -> Self {
        Self::new("tags", ConditionOperator::NotHasTag, Value::String(tag.to_string()))
    }

    pub fn is_set(field: &str) -> Self {
        Self::new(field, ConditionOperator::IsSet, Value::Null)
    }

    pub fn not_set(field: &str) -> Self {
        Self::new(field, ConditionOperator::NotSet, Value::Null)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Logic {
    All,
    Any,
}

/// Conditions combined with AND/OR logic; groups nest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionGroup {
    pub logic: Logic,
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<ConditionGroup>,
}

impl ConditionGroup {
    pub fn all(conditions: Vec<Condition>) -> Self {
        Self {
            logic: Logic::All,
            conditions,
            groups: Vec::new(),
        }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Self {
            logic: Logic::Any,
            conditions,
            groups: Vec::new(),
        }
    }

    pub fn with_group(mut self, group: ConditionGroup) -> Self {
        self.groups.push(group);
        self
    }
}

/// Read-only view of the state a condition can see: the contact's current
/// attributes plus the payload of the event that created the enrollment.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub contact: &'a ContactSnapshot,
    pub trigger_payload: &'a Value,
}

impl<'a> EvalContext<'a> {
    pub fn new(contact: &'a ContactSnapshot, trigger_payload: &'a Value) -> Self {
        Self {
            contact,
            trigger_payload,
        }
    }

    /// Resolve a dotted field path against the context.
    pub fn lookup(&self, field: &str) -> Option<Value> {
        if let Some(path) = field.strip_prefix("contact.") {
            return match path {
                "email" => self.contact.email.clone().map(Value::String),
                "phone" => self.contact.phone.clone().map(Value::String),
                _ => nested(&self.contact.attributes, path),
            };
        }
        if let Some(path) = field.strip_prefix("event.") {
            return nested(self.trigger_payload, path);
        }
        nested(self.trigger_payload, field).or_else(|| nested(&self.contact.attributes, field))
    }
}

fn nested(json: &Value, path: &str) -> Option<Value> {
    let mut current = json;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current.clone())
}

/// Select a branch for a condition or goal step. Pure and retryable.
pub fn evaluate(group: &ConditionGroup, ctx: &EvalContext) -> &'static str {
    if evaluate_group(group, ctx) {
        BRANCH_TRUE
    } else {
        BRANCH_FALSE
    }
}

fn evaluate_group(group: &ConditionGroup, ctx: &EvalContext) -> bool {
    let conditions = group.conditions.iter().map(|c| evaluate_condition(c, ctx));
    let subgroups = group.groups.iter().map(|g| evaluate_group(g, ctx));
    let mut all = conditions.chain(subgroups);
    match group.logic {
        Logic::All => all.all(|r| r),
        Logic::Any => all.any(|r| r),
    }
}

fn evaluate_condition(condition: &Condition, ctx: &EvalContext) -> bool {
    use ConditionOperator::*;

    match condition.operator {
        HasTag => return tag_value(condition).is_some_and(|t| ctx.contact.has_tag(t)),
        NotHasTag => return tag_value(condition).is_none_or(|t| !ctx.contact.has_tag(t)),
        IsSet => return matches!(ctx.lookup(&condition.field), Some(v) if !v.is_null()),
        NotSet => return !matches!(ctx.lookup(&condition.field), Some(v) if !v.is_null()),
        _ => {}
    }

    // Comparison operators: an absent or null value always takes the falsy
    // branch. Branch on absence with is_set/not_set instead.
    let Some(value) = ctx.lookup(&condition.field) else {
        return false;
    };
    if value.is_null() {
        return false;
    }

    match condition.operator {
        Equals => value == condition.value,
        NotEquals => value != condition.value,
        Contains => contains(&value, &condition.value),
        NotContains => !contains(&value, &condition.value),
        GreaterThan => match (value.as_f64(), condition.value.as_f64()) {
            (Some(v), Some(c)) => v > c,
            _ => false,
        },
        LessThan => match (value.as_f64(), condition.value.as_f64()) {
            (Some(v), Some(c)) => v < c,
            _ => false,
        },
        HasTag | NotHasTag | IsSet | NotSet => unreachable!("handled above"),
    }
}

fn tag_value(condition: &Condition) -> Option<&str> {
    condition.value.as_str()
}

fn contains(value: &Value, needle: &Value) -> bool {
    match value {
        Value::String(s) => needle
            .as_str()
            .is_some_and(|n| s.to_lowercase().contains(&n.to_lowercase())),
        Value::Array(items) => items.contains(needle),
        _ => false,
    }
}
