// Trigger dispatcher routing: tenant isolation, payload filters and
// manual enrollment.

use serde_json::json;
use uuid::Uuid;

use crate::automation::{DomainEvent, TriggerSpec, TriggerType};
use crate::tests::fixtures::{onboarding_workflow, single_email_workflow, Harness};

#[tokio::test]
async fn test_events_never_cross_tenants() {
    let harness = Harness::new();
    let tenant_a = Uuid::new_v4();
    let tenant_b = Uuid::new_v4();
    let workflow = onboarding_workflow(tenant_a);
    harness.install(&workflow).await;

    let enrolled = harness
        .triggers
        .handle_event(&DomainEvent::contact_created(tenant_b, Uuid::new_v4()))
        .await
        .unwrap();
    assert!(enrolled.is_empty());
}

#[tokio::test]
async fn test_payload_filter_selects_matching_workflow_only() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let mut workflow = single_email_workflow(tenant);
    workflow.trigger = TriggerSpec::on(TriggerType::FormSubmitted)
        .with_filter("form_id", json!("demo-request"));
    harness.install(&workflow).await;

    let miss = harness
        .triggers
        .handle_event(&DomainEvent::form_submitted(
            tenant,
            Uuid::new_v4(),
            "newsletter",
            json!({}),
        ))
        .await
        .unwrap();
    assert!(miss.is_empty());

    let hit = harness
        .triggers
        .handle_event(&DomainEvent::form_submitted(
            tenant,
            Uuid::new_v4(),
            "demo-request",
            json!({"email": "ada@example.com"}),
        ))
        .await
        .unwrap();
    assert_eq!(hit.len(), 1);
}

#[tokio::test]
async fn test_draft_workflows_are_not_indexed() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    // Insert without activating: stays a draft.
    let mut workflow = onboarding_workflow(tenant);
    workflow.status = crate::automation::WorkflowStatus::Draft;
    harness.install(&workflow).await;

    let enrolled = harness
        .triggers
        .handle_event(&DomainEvent::contact_created(tenant, Uuid::new_v4()))
        .await
        .unwrap();
    assert!(enrolled.is_empty());
}

#[tokio::test]
async fn test_manual_enroll_reports_enrolled_and_skipped() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let workflow = onboarding_workflow(tenant);
    harness.install(&workflow).await;

    let already_open = Uuid::new_v4();
    harness
        .triggers
        .handle_event(&DomainEvent::contact_created(tenant, already_open))
        .await
        .unwrap();

    let fresh = Uuid::new_v4();
    let batch = harness
        .triggers
        .enroll_contacts(workflow.id, &[already_open, fresh])
        .await
        .unwrap();
    assert_eq!(batch.skipped, vec![already_open]);
    assert_eq!(batch.enrolled.len(), 1);
}

#[tokio::test]
async fn test_manual_enroll_rejects_inactive_workflow() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let mut workflow = onboarding_workflow(tenant);
    workflow.pause();
    harness.install(&workflow).await;

    let result = harness
        .triggers
        .enroll_contacts(workflow.id, &[Uuid::new_v4()])
        .await;
    assert!(result.is_err());
}
