// End-to-end engine scenarios over the in-memory store: enrollment,
// waits, branching, goals, retries and version pinning.

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::automation::{
    ActionConfig, AutomationStore, Connection, DomainEvent, EnrollmentStatus, RetryPolicy, Step,
    StepConfig, StepOutcome,
};
use crate::jobs::ResumeSweep;
use crate::tests::fixtures::{
    contact_with_tags, goal_gate_workflow, onboarding_workflow, single_email_workflow,
    vip_branch_workflow, Harness,
};

#[tokio::test]
async fn test_enrollment_runs_to_wait_and_suspends() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let workflow = onboarding_workflow(tenant);
    harness.install(&workflow).await;

    let event = DomainEvent::contact_created(tenant, Uuid::new_v4());
    let enrolled = harness.triggers.handle_event(&event).await.unwrap();
    assert_eq!(enrolled.len(), 1);

    let enrollment = harness
        .store
        .get_enrollment(enrolled[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Waiting);
    assert!(enrollment.resume_at.is_some_and(|at| at > Utc::now()));
    assert_eq!(harness.caps.calls_to("add_tag"), 1);
    assert_eq!(harness.caps.calls_to("send_email"), 0);

    // History: tag delivered, then the wait was scheduled.
    assert!(matches!(
        enrollment.history[0].outcome,
        StepOutcome::ActionDelivered
    ));
    assert!(matches!(
        enrollment.history[1].outcome,
        StepOutcome::WaitScheduled { .. }
    ));
}

#[tokio::test]
async fn test_resume_after_wait_completes_enrollment() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let workflow = onboarding_workflow(tenant);
    harness.install(&workflow).await;

    let event = DomainEvent::contact_created(tenant, Uuid::new_v4());
    let enrolled = harness.triggers.handle_event(&event).await.unwrap();

    let sweep = ResumeSweep::new(harness.store.clone(), harness.engine.clone(), 100);
    let summary = sweep.run(Utc::now() + Duration::days(2)).await.unwrap();
    assert_eq!(summary.claimed, 1);
    assert_eq!(summary.completed, 1);

    let enrollment = harness
        .store
        .get_enrollment(enrolled[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    assert_eq!(harness.caps.calls_to("send_email"), 1);

    let stats = harness.stats.summary(workflow.id).await.unwrap();
    assert_eq!(stats.triggered, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_condition_dead_end_completes_not_fails() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let workflow = vip_branch_workflow(tenant);
    harness.install(&workflow).await;

    // Contact has no vip tag: the condition is false and there is no
    // false edge, so the enrollment exits cleanly.
    harness.caps.set_snapshot(contact_with_tags(&[]));
    let event = DomainEvent::contact_created(tenant, Uuid::new_v4());
    let enrolled = harness.triggers.handle_event(&event).await.unwrap();

    let enrollment = harness
        .store
        .get_enrollment(enrolled[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    assert_eq!(harness.caps.calls_to("send_email"), 0);
    assert!(enrollment
        .history
        .iter()
        .any(|h| matches!(h.outcome, StepOutcome::DeadEnd)));
}

#[tokio::test]
async fn test_condition_true_branch_dispatches_action() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let workflow = vip_branch_workflow(tenant);
    harness.install(&workflow).await;

    harness.caps.set_snapshot(contact_with_tags(&["vip"]));
    let event = DomainEvent::contact_created(tenant, Uuid::new_v4());
    let enrolled = harness.triggers.handle_event(&event).await.unwrap();

    let enrollment = harness
        .store
        .get_enrollment(enrolled[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    assert_eq!(harness.caps.calls_to("send_email"), 1);
    assert!(enrollment.history.iter().any(
        |h| matches!(&h.outcome, StepOutcome::BranchTaken { branch } if branch == "true")
    ));
}

#[tokio::test]
async fn test_action_failures_exhaust_retries_then_fail() {
    let harness = Harness::with_retry(RetryPolicy {
        max_attempts: 3,
        base_delay_secs: 60,
        max_delay_secs: 3600,
    });
    let tenant = Uuid::new_v4();
    let workflow = single_email_workflow(tenant);
    harness.install(&workflow).await;
    harness.caps.fail("send_email");

    let event = DomainEvent::contact_created(tenant, Uuid::new_v4());
    let enrolled = harness.triggers.handle_event(&event).await.unwrap();
    let id = enrolled[0];

    // First attempt failed inline; the enrollment is parked for backoff,
    // still active.
    let parked = harness.store.get_enrollment(id).await.unwrap().unwrap();
    assert_eq!(parked.status, EnrollmentStatus::Active);
    assert_eq!(parked.attempts, 1);
    assert!(parked.resume_at.is_some());

    // Two more sweeps well past any backoff exhaust the budget.
    let sweep = ResumeSweep::new(harness.store.clone(), harness.engine.clone(), 100);
    sweep.run(Utc::now() + Duration::hours(3)).await.unwrap();
    let summary = sweep.run(Utc::now() + Duration::hours(6)).await.unwrap();
    assert_eq!(summary.failed, 1);

    let failed = harness.store.get_enrollment(id).await.unwrap().unwrap();
    assert_eq!(failed.status, EnrollmentStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert!(failed
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("send_email")));
    assert!(failed.resume_at.is_none());
    assert_eq!(harness.caps.calls_to("send_email"), 3);

    // No further claims once failed.
    let idle = sweep.run(Utc::now() + Duration::hours(9)).await.unwrap();
    assert_eq!(idle.claimed, 0);

    let stats = harness.stats.summary(workflow.id).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 0);
}

#[tokio::test]
async fn test_default_reentry_policy_keeps_one_open_enrollment() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let workflow = onboarding_workflow(tenant);
    harness.install(&workflow).await;

    let contact = Uuid::new_v4();
    let first = harness
        .triggers
        .handle_event(&DomainEvent::contact_created(tenant, contact))
        .await
        .unwrap();
    let second = harness
        .triggers
        .handle_event(&DomainEvent::contact_created(tenant, contact))
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert!(second.is_empty());

    let stats = harness.stats.summary(workflow.id).await.unwrap();
    assert_eq!(stats.triggered, 1);
}

#[tokio::test]
async fn test_simultaneous_triggers_yield_one_open_enrollment() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let workflow = onboarding_workflow(tenant);
    harness.install(&workflow).await;

    // Two events for the same contact in flight at once: the store's
    // insert-if-absent decides the race, not the dispatcher.
    let contact = Uuid::new_v4();
    let event_a = DomainEvent::contact_created(tenant, contact);
    let event_b = DomainEvent::contact_created(tenant, contact);
    let (first, second) = tokio::join!(
        harness.triggers.handle_event(&event_a),
        harness.triggers.handle_event(&event_b),
    );
    let enrolled = first.unwrap().len() + second.unwrap().len();
    assert_eq!(enrolled, 1);

    let stats = harness.stats.summary(workflow.id).await.unwrap();
    assert_eq!(stats.triggered, 1);
}

#[tokio::test]
async fn test_paused_workflow_accepts_no_new_enrollments() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let mut workflow = onboarding_workflow(tenant);
    harness.install(&workflow).await;

    workflow.pause();
    harness.store.update_workflow(&workflow).await.unwrap();
    harness.triggers.rebuild_index().await.unwrap();

    let enrolled = harness
        .triggers
        .handle_event(&DomainEvent::contact_created(tenant, Uuid::new_v4()))
        .await
        .unwrap();
    assert!(enrolled.is_empty());
}

#[tokio::test]
async fn test_archived_workflow_cancels_waiting_enrollment_at_resume() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let mut workflow = onboarding_workflow(tenant);
    harness.install(&workflow).await;

    let enrolled = harness
        .triggers
        .handle_event(&DomainEvent::contact_created(tenant, Uuid::new_v4()))
        .await
        .unwrap();

    workflow.archive();
    harness.store.update_workflow(&workflow).await.unwrap();

    let sweep = ResumeSweep::new(harness.store.clone(), harness.engine.clone(), 100);
    let summary = sweep.run(Utc::now() + Duration::days(2)).await.unwrap();
    assert_eq!(summary.cancelled, 1);

    let enrollment = harness
        .store
        .get_enrollment(enrolled[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Cancelled);
    // The post-wait email never went out.
    assert_eq!(harness.caps.calls_to("send_email"), 0);
}

#[tokio::test]
async fn test_goal_met_short_circuits_remaining_steps() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let workflow = goal_gate_workflow(tenant);
    harness.install(&workflow).await;

    harness.caps.set_snapshot(contact_with_tags(&["customer"]));
    let enrolled = harness
        .triggers
        .handle_event(&DomainEvent::contact_created(tenant, Uuid::new_v4()))
        .await
        .unwrap();

    let enrollment = harness
        .store
        .get_enrollment(enrolled[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    assert!(enrollment
        .history
        .iter()
        .any(|h| matches!(h.outcome, StepOutcome::GoalMet)));
    assert_eq!(harness.caps.calls_to("send_email"), 0);
}

#[tokio::test]
async fn test_goal_not_met_continues_past_the_goal() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let workflow = goal_gate_workflow(tenant);
    harness.install(&workflow).await;

    harness.caps.set_snapshot(contact_with_tags(&[]));
    let enrolled = harness
        .triggers
        .handle_event(&DomainEvent::contact_created(tenant, Uuid::new_v4()))
        .await
        .unwrap();

    let enrollment = harness
        .store
        .get_enrollment(enrolled[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    assert!(enrollment
        .history
        .iter()
        .any(|h| matches!(h.outcome, StepOutcome::GoalNotMet)));
    assert_eq!(harness.caps.calls_to("send_email"), 1);
}

#[tokio::test]
async fn test_snapshot_outage_takes_falsy_branch_instead_of_failing() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let workflow = vip_branch_workflow(tenant);
    harness.install(&workflow).await;

    harness.caps.make_snapshot_unavailable();
    let enrolled = harness
        .triggers
        .handle_event(&DomainEvent::contact_created(tenant, Uuid::new_v4()))
        .await
        .unwrap();

    let enrollment = harness
        .store
        .get_enrollment(enrolled[0])
        .await
        .unwrap()
        .unwrap();
    // Evaluated against an empty snapshot: false branch, clean exit.
    assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    assert_eq!(harness.caps.calls_to("send_email"), 0);
}

#[tokio::test]
async fn test_enrollment_keeps_pinned_version_across_edits() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let mut workflow = onboarding_workflow(tenant);
    harness.install(&workflow).await;

    let enrolled = harness
        .triggers
        .handle_event(&DomainEvent::contact_created(tenant, Uuid::new_v4()))
        .await
        .unwrap();

    // Structural edit after enrollment: v2 appends an SMS step.
    let email_step = workflow
        .steps
        .iter()
        .find(|s| s.name == "Welcome email")
        .unwrap()
        .id;
    let goal_step = workflow
        .steps
        .iter()
        .find(|s| s.name == "Became customer")
        .unwrap()
        .id;
    let sms = Step::new("Follow-up SMS", StepConfig::Action(ActionConfig::send_sms("Hi!")));
    workflow
        .connections
        .retain(|c| !(c.from_step_id == email_step && c.to_step_id == goal_step));
    workflow.connections.push(Connection::new(email_step, sms.id));
    workflow.connections.push(Connection::new(sms.id, goal_step));
    workflow.steps.push(sms);
    workflow.version += 1;
    harness.store.update_workflow(&workflow).await.unwrap();

    let sweep = ResumeSweep::new(harness.store.clone(), harness.engine.clone(), 100);
    sweep.run(Utc::now() + Duration::days(2)).await.unwrap();

    let enrollment = harness
        .store
        .get_enrollment(enrolled[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(enrollment.workflow_version, 1);
    assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    // The v1 graph has no SMS step.
    assert_eq!(harness.caps.calls_to("send_sms"), 0);
    assert_eq!(harness.caps.calls_to("send_email"), 1);
}

#[tokio::test]
async fn test_terminal_stat_replay_counts_once() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let workflow = single_email_workflow(tenant);
    harness.install(&workflow).await;

    let enrolled = harness
        .triggers
        .handle_event(&DomainEvent::contact_created(tenant, Uuid::new_v4()))
        .await
        .unwrap();
    let enrollment = harness
        .store
        .get_enrollment(enrolled[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Completed);

    // Replaying the terminal transition must not double-count.
    harness.stats.record_terminal(&enrollment).await.unwrap();
    let stats = harness.stats.summary(workflow.id).await.unwrap();
    assert_eq!(stats.completed, 1);
}
