//! Timer-driven job scheduler.
//!
//! Every scheduled job gets its own driver task that sleeps until the next
//! firing time, takes a permit from the shared worker pool, and makes
//! exactly one [`ProcessEngine`] call.  Because a job's firings all run on
//! its one driver, they are serialized: a firing that overruns the interval
//! delays the next one instead of overlapping it.
//!
//! # Job lifecycle
//!
//! ```text
//!              ┌────────────── remaining > 0 ─────────────┐
//!              v                                           │
//! schedule --> Scheduled --> (permit) --> Firing --> fired ┤
//!                 │                          │             └── remaining == 0 --> removed
//!                 └── cancel --> removed     └── target gone --> removed
//! ```
//!
//! The job table maps ids to cancellation handles.  It is owned by the
//! scheduler and drained by [`JobScheduler::shutdown`]; no lock on it is
//! ever held across an await.
//!
//! Cancellation is best-effort: a job waiting for its time or for a permit
//! stops immediately, while an engine call already in progress runs to
//! completion and the job is removed afterwards.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::engine::{EngineError, ProcessEngine};
use crate::error::{JobError, Result};
use crate::job::{JobInfo, JobStatus, JobTarget, ScheduledJob, TIMER_TRIGGERED, TimerFired};

// ---------------------------------------------------------------------------
// Internal types
// ---------------------------------------------------------------------------

struct JobEntry {
    /// Distinguishes this registration from a later one under the same id.
    generation: u64,
    info: JobInfo,
    /// Dropping or signalling the sender stops the driver.
    cancel: watch::Sender<bool>,
    driver: Option<JoinHandle<()>>,
}

/// How one firing ended.
enum FiringOutcome {
    Fired,
    TargetGone(EngineError),
    Failed(String),
}

struct SchedulerInner {
    engine: Arc<dyn ProcessEngine>,
    jobs: DashMap<String, JobEntry>,
    permits: Arc<Semaphore>,
    shutdown: AtomicBool,
    generations: AtomicU64,
    config: SchedulerConfig,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// One-shot and recurring timers that call back into the process engine.
///
/// Cheaply cloneable (`Arc`-backed); all clones drive the same job table.
/// Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    pub fn new(engine: Arc<dyn ProcessEngine>, config: SchedulerConfig) -> Self {
        info!(
            max_concurrent_firings = config.worker_permits(),
            shutdown_timeout_ms = config.shutdown_timeout_ms,
            "job scheduler created"
        );
        Self {
            inner: Arc::new(SchedulerInner {
                engine,
                jobs: DashMap::new(),
                permits: Arc::new(Semaphore::new(config.worker_permits())),
                shutdown: AtomicBool::new(false),
                generations: AtomicU64::new(0),
                config,
            }),
        }
    }

    /// Scheduler with default configuration.
    pub fn with_defaults(engine: Arc<dyn ProcessEngine>) -> Self {
        Self::new(engine, SchedulerConfig::default())
    }

    /// Schedule `job` as one-shot or recurring depending on its interval.
    pub fn schedule(&self, job: ScheduledJob) -> Result<()> {
        if job.is_recurring() {
            self.schedule_recurring(job)
        } else {
            self.schedule_once(job)
        }
    }

    /// Fire `job` once at its expiration time; any repeat settings are
    /// ignored.
    pub fn schedule_once(&self, mut job: ScheduledJob) -> Result<()> {
        job.repeat_interval = None;
        job.repeat_limit = None;
        self.register(job)
    }

    /// Fire `job` at its expiration time and then every `repeat_interval`,
    /// `repeat_limit + 1` times in total or until cancelled.
    pub fn schedule_recurring(&self, job: ScheduledJob) -> Result<()> {
        if !job.is_recurring() {
            return Err(JobError::InvalidJob {
                job_id: job.id,
                reason: "recurring job needs a repeat interval".into(),
            });
        }
        self.register(job)
    }

    /// Remove a job.  Returns `false` if no job with this id is active.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.inner.jobs.remove(job_id) {
            Some((_, entry)) => {
                let _ = entry.cancel.send(true);
                info!(job_id, status = ?entry.info.status, "job cancelled");
                true
            }
            None => {
                debug!(job_id, "cancel: job not found");
                false
            }
        }
    }

    /// Snapshot of one active job.
    pub fn job(&self, job_id: &str) -> Option<JobInfo> {
        self.inner.jobs.get(job_id).map(|entry| entry.info.clone())
    }

    /// Snapshot of all active jobs, ordered by id.
    pub fn jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self
            .inner
            .jobs
            .iter()
            .map(|entry| entry.info.clone())
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub fn active_count(&self) -> usize {
        self.inner.jobs.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting jobs, cancel every active one, and wait up to the
    /// configured timeout for drivers to finish their current firing.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(active = self.active_count(), "job scheduler shutting down");
        self.inner.permits.close();

        let ids: Vec<String> = self
            .inner
            .jobs
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut drivers = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, mut entry)) = self.inner.jobs.remove(&id) {
                let _ = entry.cancel.send(true);
                if let Some(driver) = entry.driver.take() {
                    drivers.push(driver);
                }
            }
        }

        let timeout = self.inner.config.shutdown_timeout();
        match tokio::time::timeout(timeout, futures::future::join_all(drivers)).await {
            Ok(_) => info!("job scheduler stopped"),
            Err(_) => warn!(
                timeout_ms = self.inner.config.shutdown_timeout_ms,
                "job scheduler stopped with firings still running"
            ),
        }
    }

    // -- Private helpers ----------------------------------------------------

    fn register(&self, job: ScheduledJob) -> Result<()> {
        if self.is_shutdown() {
            return Err(JobError::SchedulerShutdown);
        }
        job.validate()?;

        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let info = JobInfo {
            id: job.id.clone(),
            target: job.target.clone(),
            status: JobStatus::Scheduled,
            scheduled_at: Utc::now(),
            next_fire_at: job.fire_time(0),
            firings: 0,
            remaining: job.total_firings(),
        };

        let job_id = job.id.clone();
        match self.inner.jobs.entry(job_id.clone()) {
            Entry::Occupied(_) => return Err(JobError::AlreadyScheduled { job_id }),
            Entry::Vacant(slot) => {
                let (cancel, cancelled) = watch::channel(false);
                info!(
                    job_id = %job.id,
                    process_id = job.target.process_id(),
                    expiration = %job.expiration_time,
                    interval_ms = job.repeat_interval.map(|i| i.as_millis() as u64),
                    total_firings = ?job.total_firings(),
                    "job scheduled"
                );
                let driver = tokio::spawn(drive(
                    Arc::clone(&self.inner),
                    job,
                    generation,
                    cancelled,
                ));
                slot.insert(JobEntry {
                    generation,
                    info,
                    cancel,
                    driver: Some(driver),
                });
            }
        }

        // A shutdown may have drained the table between the first check and
        // the insert.
        if self.is_shutdown() {
            if let Some((_, entry)) = self
                .inner
                .jobs
                .remove_if(&job_id, |_, entry| entry.generation == generation)
            {
                let _ = entry.cancel.send(true);
            }
            return Err(JobError::SchedulerShutdown);
        }
        Ok(())
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("active", &self.active_count())
            .field("shutdown", &self.is_shutdown())
            .field("config", &self.inner.config)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Delay until `job` first fires; past times fire immediately.
fn initial_delay(job: &ScheduledJob) -> Duration {
    (job.expiration_time - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Run every firing of one job, then deregister it.
async fn drive(
    inner: Arc<SchedulerInner>,
    job: ScheduledJob,
    generation: u64,
    cancelled: watch::Receiver<bool>,
) {
    let firings = run_firings(&inner, &job, generation, cancelled).await;

    let removed = inner
        .jobs
        .remove_if(&job.id, |_, entry| entry.generation == generation)
        .is_some();
    if removed {
        info!(job_id = %job.id, firings, "job removed");
    }
}

/// Fire `job` until it is exhausted, cancelled, or its target is gone.
/// Returns the number of firings started.
async fn run_firings(
    inner: &SchedulerInner,
    job: &ScheduledJob,
    generation: u64,
    mut cancelled: watch::Receiver<bool>,
) -> u64 {
    let total = job.total_firings();
    let mut firing: u64 = 0;
    let Some(mut due) = Instant::now().checked_add(initial_delay(job)) else {
        warn!(job_id = %job.id, expiration = %job.expiration_time, "first firing time out of range");
        return firing;
    };

    loop {
        tokio::select! {
            biased;
            _ = cancelled.changed() => {
                debug!(job_id = %job.id, "driver stopped while waiting");
                return firing;
            }
            _ = tokio::time::sleep_until(due) => {}
        }

        let permit = tokio::select! {
            biased;
            _ = cancelled.changed() => {
                debug!(job_id = %job.id, "driver stopped while waiting for a worker");
                return firing;
            }
            permit = Arc::clone(&inner.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(job_id = %job.id, "worker pool closed");
                    return firing;
                }
            },
        };

        firing += 1;
        let remaining = total.map(|t| t.saturating_sub(firing));
        update_info(inner, &job.id, generation, |info| {
            info.status = JobStatus::Firing;
            info.firings = firing;
            info.remaining = remaining;
        });

        let outcome = fire(inner.engine.as_ref(), job, firing, remaining).await;
        drop(permit);

        match outcome {
            FiringOutcome::Fired => {
                debug!(job_id = %job.id, firing, ?remaining, "job fired");
            }
            FiringOutcome::TargetGone(err) => {
                info!(job_id = %job.id, firing, %err, "job target vanished, cancelling job");
                return firing;
            }
            FiringOutcome::Failed(reason) => {
                warn!(job_id = %job.id, firing, ?remaining, %reason, "job firing failed");
            }
        }

        if remaining == Some(0) {
            debug!(job_id = %job.id, firings = firing, "job exhausted");
            return firing;
        }

        let Some(interval) = job.repeat_interval else {
            return firing;
        };
        let Some(next_due) = due.checked_add(interval) else {
            warn!(job_id = %job.id, firings = firing, ?interval, "next firing time out of range, stopping job");
            return firing;
        };
        due = next_due;
        let next_fire_at = job.fire_time(firing);
        update_info(inner, &job.id, generation, |info| {
            info.status = JobStatus::Scheduled;
            info.next_fire_at = next_fire_at;
        });
    }
}

fn update_info(
    inner: &SchedulerInner,
    job_id: &str,
    generation: u64,
    update: impl FnOnce(&mut JobInfo),
) {
    if let Some(mut entry) = inner.jobs.get_mut(job_id)
        && entry.generation == generation
    {
        update(&mut entry.info);
    }
}

/// Make the one engine call of a firing.  Panics count as failures.
async fn fire(
    engine: &dyn ProcessEngine,
    job: &ScheduledJob,
    firing: u64,
    remaining: Option<u64>,
) -> FiringOutcome {
    let fired = TimerFired {
        job_id: job.id.clone(),
        fired_at: Utc::now(),
        firing,
        remaining,
    };
    let payload = match serde_json::to_value(&fired) {
        Ok(payload) => payload,
        Err(err) => return FiringOutcome::Failed(format!("cannot encode timer payload: {err}")),
    };

    let call = async {
        match &job.target {
            JobTarget::StartProcess { process_id } => engine
                .start_process(process_id, &payload)
                .await
                .map(|instance_id| {
                    debug!(job_id = %job.id, process_id = %process_id, %instance_id, "timer started instance");
                }),
            JobTarget::SignalInstance {
                process_id,
                instance_id,
            } => {
                engine
                    .signal_instance(process_id, instance_id, TIMER_TRIGGERED, &payload)
                    .await
            }
        }
    };

    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => FiringOutcome::Fired,
        Ok(Err(err)) if err.is_target_gone() => FiringOutcome::TargetGone(err),
        Ok(Err(err)) => FiringOutcome::Failed(err.to_string()),
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(job_id = %job.id, firing, %reason, "engine callback panicked");
            FiringOutcome::Failed(format!("engine callback panicked: {reason}"))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
