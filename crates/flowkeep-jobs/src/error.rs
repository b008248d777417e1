//! Scheduler error types.
//!
//! Scheduling calls surface errors through [`JobError`].  Failures inside a
//! firing never reach the caller that scheduled the job; they are engine
//! errors ([`crate::engine::EngineError`]) handled by the scheduler itself.

/// Errors returned by the scheduling API.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// A job with this id is already active.
    #[error("job already scheduled: {job_id}")]
    AlreadyScheduled { job_id: String },

    /// The job definition cannot be scheduled as given.
    #[error("invalid job {job_id}: {reason}")]
    InvalidJob { job_id: String, reason: String },

    /// The scheduler has been shut down and will not accept new work.
    #[error("scheduler is shut down")]
    SchedulerShutdown,
}

/// Convenience alias used throughout the jobs crate.
pub type Result<T> = std::result::Result<T, JobError>;
