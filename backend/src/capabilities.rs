// Platform Capabilities - external collaborators the engine calls into
//
// The automation engine never owns contact records, message transports or
// calendars; it consumes them through this trait. The production
// implementation talks to the platform's internal services over HTTP.

use async_trait::async_trait;
use nurture_shared::{AppointmentRequest, ContactSnapshot, PipelineStageRef, TaskRequest};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("capability rejected the call ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid capability request: {0}")]
    Invalid(String),
}

/// How a capability accepted a call. `Deferred` means accepted but
/// processed asynchronously; the engine treats both as success for
/// graph advancement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Deferred,
}

#[async_trait]
pub trait Capabilities: Send + Sync {
    async fn contact_snapshot(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
    ) -> Result<ContactSnapshot, CapabilityError>;

    async fn send_email(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
        subject: &str,
        body: &str,
    ) -> Result<Delivery, CapabilityError>;

    async fn send_sms(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
        message: &str,
    ) -> Result<Delivery, CapabilityError>;

    async fn add_tag(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
        tag: &str,
    ) -> Result<Delivery, CapabilityError>;

    async fn remove_tag(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
        tag: &str,
    ) -> Result<Delivery, CapabilityError>;

    async fn move_pipeline_stage(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
        stage: &PipelineStageRef,
    ) -> Result<Delivery, CapabilityError>;

    async fn create_task(&self, task: &TaskRequest) -> Result<Delivery, CapabilityError>;

    async fn call_webhook(
        &self,
        url: &str,
        method: &str,
        payload: &Value,
    ) -> Result<Delivery, CapabilityError>;

    async fn book_appointment(
        &self,
        appointment: &AppointmentRequest,
    ) -> Result<Delivery, CapabilityError>;
}

/// HTTP client against the platform's internal capability services.
/// Webhook calls go straight to the user-supplied URL instead.
pub struct RestCapabilities {
    client: reqwest::Client,
    base_url: String,
}

impl RestCapabilities {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self, CapabilityError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, path: &str, payload: &Value) -> Result<Delivery, CapabilityError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(payload).send().await?;
        Self::delivery_from(response).await
    }

    async fn delivery_from(response: reqwest::Response) -> Result<Delivery, CapabilityError> {
        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(Delivery::Deferred);
        }
        if status.is_success() {
            return Ok(Delivery::Delivered);
        }
        let message = response.text().await.unwrap_or_default();
        Err(CapabilityError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl Capabilities for RestCapabilities {
    async fn contact_snapshot(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
    ) -> Result<ContactSnapshot, CapabilityError> {
        let url = format!("{}/contacts/{}/{}", self.base_url, tenant_id, contact_id);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    async fn send_email(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
        subject: &str,
        body: &str,
    ) -> Result<Delivery, CapabilityError> {
        self.post(
            "/messaging/email",
            &serde_json::json!({
                "tenant_id": tenant_id,
                "contact_id": contact_id,
                "subject": subject,
                "body": body,
            }),
        )
        .await
    }

    async fn send_sms(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
        message: &str,
    ) -> Result<Delivery, CapabilityError> {
        self.post(
            "/messaging/sms",
            &serde_json::json!({
                "tenant_id": tenant_id,
                "contact_id": contact_id,
                "message": message,
            }),
        )
        .await
    }

    async fn add_tag(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
        tag: &str,
    ) -> Result<Delivery, CapabilityError> {
        self.post(
            "/contacts/tags/add",
            &serde_json::json!({
                "tenant_id": tenant_id,
                "contact_id": contact_id,
                "tag": tag,
            }),
        )
        .await
    }

    async fn remove_tag(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
        tag: &str,
    ) -> Result<Delivery, CapabilityError> {
        self.post(
            "/contacts/tags/remove",
            &serde_json::json!({
                "tenant_id": tenant_id,
                "contact_id": contact_id,
                "tag": tag,
            }),
        )
        .await
    }

    async fn move_pipeline_stage(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
        stage: &PipelineStageRef,
    ) -> Result<Delivery, CapabilityError> {
        self.post(
            "/pipelines/move",
            &serde_json::json!({
                "tenant_id": tenant_id,
                "contact_id": contact_id,
                "pipeline_id": stage.pipeline_id,
                "stage_id": stage.stage_id,
            }),
        )
        .await
    }

    async fn create_task(&self, task: &TaskRequest) -> Result<Delivery, CapabilityError> {
        self.post("/tasks", &serde_json::to_value(task).map_err(|e| {
            CapabilityError::Invalid(e.to_string())
        })?)
        .await
    }

    async fn call_webhook(
        &self,
        url: &str,
        method: &str,
        payload: &Value,
    ) -> Result<Delivery, CapabilityError> {
        let request = match method.to_uppercase().as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url).json(payload),
            "PUT" => self.client.put(url).json(payload),
            "PATCH" => self.client.patch(url).json(payload),
            "DELETE" => self.client.delete(url),
            other => {
                return Err(CapabilityError::Invalid(format!(
                    "unsupported webhook method: {other}"
                )));
            }
        };
        Self::delivery_from(request.send().await?).await
    }

    async fn book_appointment(
        &self,
        appointment: &AppointmentRequest,
    ) -> Result<Delivery, CapabilityError> {
        self.post(
            "/appointments",
            &serde_json::to_value(appointment)
                .map_err(|e| CapabilityError::Invalid(e.to_string()))?,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_webhook_call_posts_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/crm"))
            .and(body_partial_json(serde_json::json!({"contact": "c-1"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let caps = RestCapabilities::new(&server.uri(), std::time::Duration::from_secs(5)).unwrap();
        let delivery = caps
            .call_webhook(
                &format!("{}/hooks/crm", server.uri()),
                "POST",
                &serde_json::json!({"contact": "c-1"}),
            )
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Delivered);
    }

    #[tokio::test]
    async fn test_accepted_maps_to_deferred() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messaging/email"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let caps = RestCapabilities::new(&server.uri(), std::time::Duration::from_secs(5)).unwrap();
        let delivery = caps
            .send_email(Uuid::new_v4(), Uuid::new_v4(), "Hi", "Body")
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Deferred);
    }

    #[tokio::test]
    async fn test_rejection_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messaging/sms"))
            .respond_with(ResponseTemplate::new(422).set_body_string("no phone on file"))
            .mount(&server)
            .await;

        let caps = RestCapabilities::new(&server.uri(), std::time::Duration::from_secs(5)).unwrap();
        let err = caps
            .send_sms(Uuid::new_v4(), Uuid::new_v4(), "hello")
            .await
            .unwrap_err();
        match err {
            CapabilityError::Rejected { status, message } => {
                assert_eq!(status, 422);
                assert!(message.contains("no phone"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
