// Workflow Actions - typed action steps and the dispatch translation layer
//
// The dispatcher is stateless: it renders template variables, makes exactly
// one capability call with a bounded timeout and reports a typed outcome.
// Retry policy lives in the enrollment engine, never here.

use chrono::{DateTime, Utc};
use nurture_shared::{AppointmentRequest, ContactSnapshot, PipelineStageRef, TaskRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use super::conditions::EvalContext;
use crate::capabilities::{Capabilities, CapabilityError, Delivery};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SendEmail,
    SendSms,
    AddTag,
    RemoveTag,
    MovePipeline,
    CreateTask,
    Webhook,
    BookAppointment,
}

/// Action step parameters. `params` is kind-specific and may carry
/// `{{contact.x}}` / `{{event.x}}` template variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionConfig {
    pub kind: ActionKind,
    #[serde(default)]
    pub params: Value,
    /// Per-action override of the engine's retry budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl ActionConfig {
    pub fn new(kind: ActionKind, params: Value) -> Self {
        Self {
            kind,
            params,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn send_email(subject: &str, body: &str) -> Self {
        Self::new(
            ActionKind::SendEmail,
            serde_json::json!({ "subject": subject, "body": body }),
        )
    }

    pub fn send_sms(message: &str) -> Self {
        Self::new(ActionKind::SendSms, serde_json::json!({ "message": message }))
    }

    pub fn add_tag(tag: &str) -> Self {
        Self::new(ActionKind::AddTag, serde_json::json!({ "tag": tag }))
    }

    pub fn remove_tag(tag: &str) -> Self {
        Self::new(ActionKind::RemoveTag, serde_json::json!({ "tag": tag }))
    }

    pub fn move_pipeline(pipeline_id: Uuid, stage_id: Uuid) -> Self {
        Self::new(
            ActionKind::MovePipeline,
            serde_json::json!({ "pipeline_id": pipeline_id, "stage_id": stage_id }),
        )
    }

    pub fn create_task(title: &str) -> Self {
        Self::new(ActionKind::CreateTask, serde_json::json!({ "title": title }))
    }

    pub fn webhook(url: &str, payload: Value) -> Self {
        Self::new(
            ActionKind::Webhook,
            serde_json::json!({ "url": url, "method": "POST", "payload": payload }),
        )
    }

    pub fn book_appointment(calendar_id: Uuid, title: &str) -> Self {
        Self::new(
            ActionKind::BookAppointment,
            serde_json::json!({ "calendar_id": calendar_id, "title": title }),
        )
    }
}

/// Typed result of one dispatch. `Deferred` counts as success for graph
/// advancement; the capability finishes the work asynchronously.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ActionOutcome {
    Delivered,
    Deferred,
    Failed { reason: String },
}

impl ActionOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

impl From<Result<Delivery, CapabilityError>> for ActionOutcome {
    fn from(result: Result<Delivery, CapabilityError>) -> Self {
        match result {
            Ok(Delivery::Delivered) => Self::Delivered,
            Ok(Delivery::Deferred) => Self::Deferred,
            Err(e) => Self::failed(e.to_string()),
        }
    }
}

/// Everything a single dispatch may read: contact state and the original
/// trigger payload, used for template rendering and capability arguments.
pub struct DispatchContext<'a> {
    pub tenant_id: Uuid,
    pub contact: &'a ContactSnapshot,
    pub trigger_payload: &'a Value,
}

pub struct ActionDispatcher {
    capabilities: Arc<dyn Capabilities>,
    timeout: Duration,
}

impl ActionDispatcher {
    pub fn new(capabilities: Arc<dyn Capabilities>, timeout: Duration) -> Self {
        Self {
            capabilities,
            timeout,
        }
    }

    /// Translate one action step into one capability call.
    pub async fn dispatch(&self, action: &ActionConfig, ctx: &DispatchContext<'_>) -> ActionOutcome {
        let eval = EvalContext::new(ctx.contact, ctx.trigger_payload);
        let params = render_templates(&action.params, &eval);

        let call = self.call_capability(action.kind, &params, ctx);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(kind = ?action.kind, "capability call timed out");
                ActionOutcome::failed(format!(
                    "capability call timed out after {}s",
                    self.timeout.as_secs()
                ))
            }
        }
    }

    async fn call_capability(
        &self,
        kind: ActionKind,
        params: &Value,
        ctx: &DispatchContext<'_>,
    ) -> ActionOutcome {
        let tenant = ctx.tenant_id;
        let contact = ctx.contact.id;

        match kind {
            ActionKind::SendEmail => {
                let (Some(subject), Some(body)) =
                    (params["subject"].as_str(), params["body"].as_str())
                else {
                    return ActionOutcome::failed("send_email requires subject and body");
                };
                self.capabilities
                    .send_email(tenant, contact, subject, body)
                    .await
                    .into()
            }
            ActionKind::SendSms => {
                let Some(message) = params["message"].as_str() else {
                    return ActionOutcome::failed("send_sms requires message");
                };
                self.capabilities
                    .send_sms(tenant, contact, message)
                    .await
                    .into()
            }
            ActionKind::AddTag => {
                let Some(tag) = params["tag"].as_str() else {
                    return ActionOutcome::failed("add_tag requires tag");
                };
                self.capabilities.add_tag(tenant, contact, tag).await.into()
            }
            ActionKind::RemoveTag => {
                let Some(tag) = params["tag"].as_str() else {
                    return ActionOutcome::failed("remove_tag requires tag");
                };
                self.capabilities
                    .remove_tag(tenant, contact, tag)
                    .await
                    .into()
            }
            ActionKind::MovePipeline => {
                let stage = match parse_stage(params) {
                    Ok(stage) => stage,
                    Err(reason) => return ActionOutcome::failed(reason),
                };
                self.capabilities
                    .move_pipeline_stage(tenant, contact, &stage)
                    .await
                    .into()
            }
            ActionKind::CreateTask => {
                let Some(title) = params["title"].as_str() else {
                    return ActionOutcome::failed("create_task requires title");
                };
                let task = TaskRequest {
                    tenant_id: tenant,
                    contact_id: contact,
                    title: title.to_string(),
                    description: params["description"].as_str().map(String::from),
                    assignee_id: parse_uuid(&params["assignee_id"]),
                    due_at: parse_timestamp(&params["due_at"]),
                };
                self.capabilities.create_task(&task).await.into()
            }
            ActionKind::Webhook => {
                let Some(url) = params["url"].as_str() else {
                    return ActionOutcome::failed("webhook requires url");
                };
                let method = params["method"].as_str().unwrap_or("POST");
                self.capabilities
                    .call_webhook(url, method, &params["payload"])
                    .await
                    .into()
            }
            ActionKind::BookAppointment => {
                let Some(calendar_id) = parse_uuid(&params["calendar_id"]) else {
                    return ActionOutcome::failed("book_appointment requires calendar_id");
                };
                let Some(title) = params["title"].as_str() else {
                    return ActionOutcome::failed("book_appointment requires title");
                };
                let appointment = AppointmentRequest {
                    tenant_id: tenant,
                    contact_id: contact,
                    calendar_id,
                    title: title.to_string(),
                    starts_at: parse_timestamp(&params["starts_at"]).unwrap_or_else(Utc::now),
                    duration_minutes: params["duration_minutes"].as_i64().unwrap_or(30) as i32,
                    notes: params["notes"].as_str().map(String::from),
                };
                self.capabilities
                    .book_appointment(&appointment)
                    .await
                    .into()
            }
        }
    }
}

fn parse_stage(params: &Value) -> Result<PipelineStageRef, &'static str> {
    let pipeline_id =
        parse_uuid(&params["pipeline_id"]).ok_or("move_pipeline requires pipeline_id")?;
    let stage_id = parse_uuid(&params["stage_id"]).ok_or("move_pipeline requires stage_id")?;
    Ok(PipelineStageRef {
        pipeline_id,
        stage_id,
    })
}

fn parse_uuid(value: &Value) -> Option<Uuid> {
    value.as_str().and_then(|s| s.parse().ok())
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Replace `{{path}}` variables throughout a params tree with values from
/// the enrollment context. Unresolvable variables are left in place.
pub fn render_templates(params: &Value, ctx: &EvalContext) -> Value {
    match params {
        Value::String(s) => Value::String(render_str(s, ctx)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_templates(v, ctx)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| render_templates(v, ctx)).collect())
        }
        other => other.clone(),
    }
}

fn render_str(template: &str, ctx: &EvalContext) -> String {
    static VAR: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = VAR.get_or_init(|| regex::Regex::new(r"\{\{\s*([^}]+?)\s*\}\}").unwrap());

    let mut result = template.to_string();
    for cap in re.captures_iter(template) {
        let path = &cap[1];
        if let Some(value) = ctx.lookup(path) {
            let replacement = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => other.to_string(),
            };
            result = result.replace(&cap[0], &replacement);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> ContactSnapshot {
        let mut snap = ContactSnapshot::unresolved(Uuid::new_v4(), Uuid::new_v4());
        snap.attributes = serde_json::json!({ "first_name": "Ada" });
        snap
    }

    #[test]
    fn test_render_templates_in_nested_params() {
        let contact = contact();
        let payload = serde_json::json!({ "form_name": "Demo request" });
        let ctx = EvalContext::new(&contact, &payload);

        let params = serde_json::json!({
            "subject": "Thanks {{contact.first_name}}!",
            "body": { "text": "You submitted {{event.form_name}}." }
        });
        let rendered = render_templates(&params, &ctx);
        assert_eq!(rendered["subject"], "Thanks Ada!");
        assert_eq!(rendered["body"]["text"], "You submitted Demo request.");
    }

    #[test]
    fn test_unresolved_template_left_in_place() {
        let contact = contact();
        let payload = Value::Null;
        let ctx = EvalContext::new(&contact, &payload);
        let rendered = render_templates(&serde_json::json!("Hi {{contact.missing}}"), &ctx);
        assert_eq!(rendered, "Hi {{contact.missing}}");
    }

    #[test]
    fn test_outcome_from_capability_result() {
        assert_eq!(
            ActionOutcome::from(Ok::<_, CapabilityError>(Delivery::Delivered)),
            ActionOutcome::Delivered
        );
        assert_eq!(
            ActionOutcome::from(Ok::<_, CapabilityError>(Delivery::Deferred)),
            ActionOutcome::Deferred
        );
        let failed = ActionOutcome::from(Err::<Delivery, _>(CapabilityError::Invalid(
            "bad".to_string(),
        )));
        assert!(!failed.is_success());
    }

    #[test]
    fn test_action_config_builders() {
        let action = ActionConfig::add_tag("lead").with_max_attempts(5);
        assert_eq!(action.kind, ActionKind::AddTag);
        assert_eq!(action.params["tag"], "lead");
        assert_eq!(action.max_attempts, Some(5));
    }

    #[test]
    fn test_action_config_serializes_snake_case() {
        let json = serde_json::to_value(ActionConfig::send_sms("hi")).unwrap();
        assert_eq!(json["kind"], "send_sms");
    }
}
