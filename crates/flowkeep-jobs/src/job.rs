//! Job definitions and snapshots.
//!
//! A [`ScheduledJob`] names what to do when it fires (its [`JobTarget`]),
//! when to fire first, and whether and how often to fire again:
//!
//! | `repeat_interval` | `repeat_limit` | firings                         |
//! |-------------------|----------------|---------------------------------|
//! | unset             | ignored        | 1                               |
//! | set               | `n`            | `n + 1`                         |
//! | set               | unset          | until cancelled                 |

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{JobError, Result};

/// Signal name used to deliver timer firings to an existing instance.
pub const TIMER_TRIGGERED: &str = "timerTriggered";

/// What a firing re-enters the engine with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobTarget {
    /// Create and start a new instance of a process definition.
    StartProcess { process_id: String },
    /// Signal an existing process instance.
    SignalInstance {
        process_id: String,
        instance_id: String,
    },
}

impl JobTarget {
    pub fn process_id(&self) -> &str {
        match self {
            Self::StartProcess { process_id } | Self::SignalInstance { process_id, .. } => {
                process_id
            }
        }
    }
}

/// A timer keyed by a caller-supplied id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub target: JobTarget,
    /// Absolute time of the first firing.  A time in the past fires
    /// immediately.
    pub expiration_time: DateTime<Utc>,
    /// Period between firings after the first.
    pub repeat_interval: Option<Duration>,
    /// Additional firings after the first; `None` is unbounded.
    pub repeat_limit: Option<u64>,
}

impl ScheduledJob {
    /// A job that starts a new instance of `process_id` at `at`.
    pub fn start_process(
        id: impl Into<String>,
        process_id: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            id,
            JobTarget::StartProcess {
                process_id: process_id.into(),
            },
            at,
        )
    }

    /// A job that signals `instance_id` of `process_id` at `at`.
    pub fn signal_instance(
        id: impl Into<String>,
        process_id: impl Into<String>,
        instance_id: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            id,
            JobTarget::SignalInstance {
                process_id: process_id.into(),
                instance_id: instance_id.into(),
            },
            at,
        )
    }

    fn new(id: impl Into<String>, target: JobTarget, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            target,
            expiration_time: at,
            repeat_interval: None,
            repeat_limit: None,
        }
    }

    /// Fire again every `interval` after the first firing.
    pub fn repeat_every(mut self, interval: Duration) -> Self {
        self.repeat_interval = Some(interval);
        self
    }

    /// Bound the number of additional firings.  Negative means unbounded.
    pub fn repeat_limit(mut self, limit: i64) -> Self {
        self.repeat_limit = u64::try_from(limit).ok();
        self
    }

    pub fn is_recurring(&self) -> bool {
        self.repeat_interval.is_some()
    }

    /// Total firings before the job removes itself; `None` if unbounded.
    pub fn total_firings(&self) -> Option<u64> {
        match (self.repeat_interval, self.repeat_limit) {
            (None, _) => Some(1),
            (Some(_), Some(limit)) => Some(limit.saturating_add(1)),
            (Some(_), None) => None,
        }
    }

    /// Wall-clock time of firing number `n` (zero-based).
    pub fn fire_time(&self, n: u64) -> DateTime<Utc> {
        let Some(interval) = self.repeat_interval else {
            return self.expiration_time;
        };
        let offset = u32::try_from(n)
            .ok()
            .and_then(|n| interval.checked_mul(n))
            .and_then(|d| TimeDelta::from_std(d).ok())
            .unwrap_or(TimeDelta::MAX);
        self.expiration_time
            .checked_add_signed(offset)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Reject definitions the scheduler cannot drive.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(self.invalid("job id must not be empty"));
        }
        if self.target.process_id().is_empty() {
            return Err(self.invalid("target process id must not be empty"));
        }
        if let JobTarget::SignalInstance { instance_id, .. } = &self.target
            && instance_id.is_empty()
        {
            return Err(self.invalid("target instance id must not be empty"));
        }
        if self.repeat_interval.is_some_and(|i| i.is_zero()) {
            return Err(self.invalid("repeat interval must be positive"));
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> JobError {
        JobError::InvalidJob {
            job_id: self.id.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Where a job is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its next firing time or a free worker.
    Scheduled,
    /// The engine callback is running.
    Firing,
}

/// Metadata snapshot of an active job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    pub target: JobTarget,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
    /// Nominal time of the next firing.
    pub next_fire_at: DateTime<Utc>,
    /// Firings started so far.
    pub firings: u64,
    /// Firings left; `None` if unbounded.
    pub remaining: Option<u64>,
}

/// Payload handed to the engine on every firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerFired {
    pub job_id: String,
    pub fired_at: DateTime<Utc>,
    /// One-based firing number.
    pub firing: u64,
    /// Firings left after this one; `None` if unbounded.
    pub remaining: Option<u64>,
}
