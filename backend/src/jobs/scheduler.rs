// Resume Scheduler - external timer for suspended enrollments
//
// Wait steps and retry backoffs never hold a task; they persist
// `resume_at` and return. This scheduler polls the due-queue, claims
// elapsed enrollments (the claim is exclusive, see the store) and hands
// each one back to the engine. Because the queue lives in the database,
// a restart simply rescans it; no timer state is lost with the process.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info, warn};

use crate::automation::{AutomationStore, EnrollmentEngine, EnrollmentStatus};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("scheduler error: {0}")]
    Scheduler(#[from] JobSchedulerError),
    #[error("store error: {0}")]
    Store(#[from] crate::automation::StoreError),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u32,
    pub batch_size: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            batch_size: 100,
        }
    }
}

/// What one sweep of the due-queue did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub claimed: usize,
    /// Ran and suspended again (another wait or retry backoff).
    pub suspended: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Engine errors; the enrollment stays claimed and is retried on a
    /// later sweep only if it still has a resume_at.
    pub errors: usize,
}

/// One claim-and-run pass over the due-queue. Separate from the cron
/// wiring so tests can drive it with a chosen clock.
pub struct ResumeSweep {
    store: Arc<dyn AutomationStore>,
    engine: Arc<EnrollmentEngine>,
    batch_size: i64,
}

impl ResumeSweep {
    pub fn new(
        store: Arc<dyn AutomationStore>,
        engine: Arc<EnrollmentEngine>,
        batch_size: i64,
    ) -> Self {
        Self {
            store,
            engine,
            batch_size,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> JobResult<TickSummary> {
        let claimed = self.store.claim_due(now, self.batch_size).await?;
        let mut summary = TickSummary {
            claimed: claimed.len(),
            ..TickSummary::default()
        };

        for enrollment_id in claimed {
            match self.engine.run(enrollment_id).await {
                Ok(enrollment) => match enrollment.status {
                    EnrollmentStatus::Completed => summary.completed += 1,
                    EnrollmentStatus::Failed => summary.failed += 1,
                    EnrollmentStatus::Cancelled => summary.cancelled += 1,
                    EnrollmentStatus::Active | EnrollmentStatus::Waiting => {
                        summary.suspended += 1
                    }
                },
                Err(e) => {
                    warn!(enrollment = %enrollment_id, error = %e, "resume failed");
                    summary.errors += 1;
                }
            }
        }

        if summary.claimed > 0 {
            info!(
                claimed = summary.claimed,
                completed = summary.completed,
                failed = summary.failed,
                cancelled = summary.cancelled,
                suspended = summary.suspended,
                "resume sweep finished"
            );
        }
        Ok(summary)
    }
}

pub struct ResumeScheduler {
    scheduler: TokioScheduler,
    store: Arc<dyn AutomationStore>,
    engine: Arc<EnrollmentEngine>,
    config: SchedulerConfig,
}

impl ResumeScheduler {
    pub async fn new(
        store: Arc<dyn AutomationStore>,
        engine: Arc<EnrollmentEngine>,
        config: SchedulerConfig,
    ) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;
        Ok(Self {
            scheduler,
            store,
            engine,
            config,
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        let cron_expr = format!("*/{} * * * * *", self.config.poll_interval_secs.max(1));
        let store = self.store.clone();
        let engine = self.engine.clone();
        let batch_size = self.config.batch_size;

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let store = store.clone();
            let engine = engine.clone();

            Box::pin(async move {
                let sweep = ResumeSweep::new(store, engine, batch_size);
                if let Err(e) = sweep.run(Utc::now()).await {
                    error!("resume sweep failed: {}", e);
                }
            })
        })?;

        self.scheduler.add(job).await?;
        self.scheduler.start().await?;
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            batch_size = self.config.batch_size,
            "resume scheduler started"
        );
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("shutting down resume scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }
}
