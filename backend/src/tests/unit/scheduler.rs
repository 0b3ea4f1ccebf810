// Resume sweep behaviour: exclusivity, due-time ordering and recovery
// after a process restart.

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::automation::{AutomationStore, DomainEvent, EnrollmentStatus};
use crate::jobs::ResumeSweep;
use crate::tests::fixtures::{onboarding_workflow, Harness};

#[tokio::test]
async fn test_sweep_skips_enrollments_not_yet_due() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let workflow = onboarding_workflow(tenant);
    harness.install(&workflow).await;

    harness
        .triggers
        .handle_event(&DomainEvent::contact_created(tenant, Uuid::new_v4()))
        .await
        .unwrap();

    // The wait is a day long; a sweep now finds nothing.
    let sweep = ResumeSweep::new(harness.store.clone(), harness.engine.clone(), 100);
    let summary = sweep.run(Utc::now()).await.unwrap();
    assert_eq!(summary.claimed, 0);
}

#[tokio::test]
async fn test_sweep_respects_batch_size() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let workflow = onboarding_workflow(tenant);
    harness.install(&workflow).await;

    for _ in 0..5 {
        harness
            .triggers
            .handle_event(&DomainEvent::contact_created(tenant, Uuid::new_v4()))
            .await
            .unwrap();
    }

    let sweep = ResumeSweep::new(harness.store.clone(), harness.engine.clone(), 2);
    let later = Utc::now() + Duration::days(2);
    assert_eq!(sweep.run(later).await.unwrap().claimed, 2);
    assert_eq!(sweep.run(later).await.unwrap().claimed, 2);
    assert_eq!(sweep.run(later).await.unwrap().claimed, 1);
    assert_eq!(sweep.run(later).await.unwrap().claimed, 0);
}

#[tokio::test]
async fn test_fresh_sweep_recovers_persisted_waits() {
    // Simulates a restart: the enrollment was suspended by one process;
    // a brand-new sweep over the same store picks it up because the
    // due-queue lives in storage, not in timers.
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let workflow = onboarding_workflow(tenant);
    harness.install(&workflow).await;

    let enrolled = harness
        .triggers
        .handle_event(&DomainEvent::contact_created(tenant, Uuid::new_v4()))
        .await
        .unwrap();

    let fresh = ResumeSweep::new(harness.store.clone(), harness.engine.clone(), 100);
    let summary = fresh.run(Utc::now() + Duration::days(2)).await.unwrap();
    assert_eq!(summary.claimed, 1);
    assert_eq!(summary.completed, 1);

    let enrollment = harness
        .store
        .get_enrollment(enrolled[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(enrollment.status, EnrollmentStatus::Completed);
}

#[tokio::test]
async fn test_cancelled_enrollment_is_never_resumed() {
    let harness = Harness::new();
    let tenant = Uuid::new_v4();
    let workflow = onboarding_workflow(tenant);
    harness.install(&workflow).await;

    let enrolled = harness
        .triggers
        .handle_event(&DomainEvent::contact_created(tenant, Uuid::new_v4()))
        .await
        .unwrap();
    assert!(harness.store.cancel_enrollment(enrolled[0]).await.unwrap());

    let sweep = ResumeSweep::new(harness.store.clone(), harness.engine.clone(), 100);
    let summary = sweep.run(Utc::now() + Duration::days(2)).await.unwrap();
    assert_eq!(summary.claimed, 0);
    assert_eq!(harness.caps.calls_to("send_email"), 0);
}
