// Background Jobs
//
// The only recurring job the engine needs: the resume scheduler that
// wakes suspended enrollments when their resume_at elapses.

pub mod scheduler;

pub use scheduler::{
    JobError, JobResult, ResumeScheduler, ResumeSweep, SchedulerConfig, TickSummary,
};
