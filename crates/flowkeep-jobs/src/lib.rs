//! Flowkeep job scheduler.
//!
//! Timers that keep long-running processes moving:
//!
//! - **[`job`]** -- job definitions ([`ScheduledJob`], [`JobTarget`]),
//!   snapshots and the [`TimerFired`] payload delivered on every firing.
//! - **[`scheduler`]** -- [`JobScheduler`], one driver task per job on a
//!   semaphore-bounded worker pool, with cancellation and shutdown.
//! - **[`engine`]** -- the [`ProcessEngine`] callback contract and
//!   [`StoreBackedEngine`], which runs instances out of a
//!   [`flowkeep_store::StoreRegistry`].
//! - **[`config`]** -- [`SchedulerConfig`].
//! - **[`error`]** -- scheduling errors via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod scheduler;

// Re-export the most commonly used types at the crate root for convenience.
pub use config::SchedulerConfig;
pub use engine::{EngineError, ProcessEngine, StoreBackedEngine};
pub use error::{JobError, Result};
pub use job::{JobInfo, JobStatus, JobTarget, ScheduledJob, TIMER_TRIGGERED, TimerFired};
pub use scheduler::JobScheduler;
