// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable job queue.
//!
//! Jobs are routed to a worker pool by action. A job is visible to one worker
//! at a time through a lease; an expired lease makes it claimable again, so
//! delivery is at-least-once and handlers must be idempotent.
//!
//! A claim is refused while another job of the same activation in the same
//! pool is leased, which gives each activation a single owner per pool.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresJobQueue;
pub use self::sqlite::SqliteJobQueue;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Worker pool identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolName {
    /// Housekeeping jobs.
    Default,
    /// Activation lifecycle jobs.
    Activation,
}

impl PoolName {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolName::Default => "default",
            PoolName::Activation => "activation",
        }
    }

    /// Worker class name used on the command line.
    pub fn worker_class(&self) -> &'static str {
        match self {
            PoolName::Default => "DefaultWorker",
            PoolName::Activation => "ActivationWorker",
        }
    }
}

impl fmt::Display for PoolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.worker_class())
    }
}

impl FromStr for PoolName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" | "DefaultWorker" => Ok(PoolName::Default),
            "activation" | "ActivationWorker" => Ok(PoolName::Activation),
            other => Err(Error::Other(format!("unknown worker pool '{other}'"))),
        }
    }
}

/// What a job asks a worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobAction {
    /// Create and supervise a container for an admitted activation.
    Start,
    /// Stop the activation's container.
    Stop,
    /// Stop, then make the activation immediately admissible again.
    Restart,
    /// Stop and delete the activation.
    Delete,
    /// Continue supervising a running container.
    Monitor,
    /// Trim closed instance history.
    PruneHistory,
}

impl JobAction {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::Start => "start",
            JobAction::Stop => "stop",
            JobAction::Restart => "restart",
            JobAction::Delete => "delete",
            JobAction::Monitor => "monitor",
            JobAction::PruneHistory => "prune_history",
        }
    }

    /// Pool the action runs on.
    pub fn pool(&self) -> PoolName {
        match self {
            JobAction::PruneHistory => PoolName::Default,
            _ => PoolName::Activation,
        }
    }

    /// Claim priority; higher first.
    pub fn priority(&self) -> i32 {
        match self {
            JobAction::Stop | JobAction::Delete | JobAction::Restart => 10,
            JobAction::Start | JobAction::Monitor | JobAction::PruneHistory => 0,
        }
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(JobAction::Start),
            "stop" => Ok(JobAction::Stop),
            "restart" => Ok(JobAction::Restart),
            "delete" => Ok(JobAction::Delete),
            "monitor" => Ok(JobAction::Monitor),
            "prune_history" => Ok(JobAction::PruneHistory),
            other => Err(Error::Other(format!("unknown job action '{other}'"))),
        }
    }
}

/// A leased or waiting job.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Identifier.
    pub id: i64,
    /// Pool the job is routed to.
    pub pool: PoolName,
    /// Target activation.
    pub activation_id: i64,
    /// Requested action.
    pub action: JobAction,
    /// Claim priority.
    pub priority: i32,
    /// When the job was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Earliest claim time.
    pub not_before: DateTime<Utc>,
    /// Redeliveries so far.
    pub retry_count: u32,
    /// Current lease holder.
    pub lease_owner: Option<String>,
    /// Lease expiry.
    pub leased_until: Option<DateTime<Utc>>,
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new job was inserted.
    Enqueued(i64),
    /// An identical job is already waiting.
    Duplicate(i64),
}

impl EnqueueOutcome {
    /// Id of the waiting job.
    pub fn job_id(&self) -> i64 {
        match self {
            EnqueueOutcome::Enqueued(id) | EnqueueOutcome::Duplicate(id) => *id,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub pool: String,
    pub activation_id: i64,
    pub action: String,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    pub retry_count: i32,
    pub lease_owner: Option<String>,
    pub leased_until: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: row.id,
            pool: row.pool.parse()?,
            activation_id: row.activation_id,
            action: row.action.parse()?,
            priority: row.priority,
            enqueued_at: row.enqueued_at,
            not_before: row.not_before,
            retry_count: row.retry_count.max(0) as u32,
            lease_owner: row.lease_owner,
            leased_until: row.leased_until,
        })
    }
}

pub(crate) const JOB_COLUMNS: &str = "id, pool, activation_id, action, priority, enqueued_at, \
    not_before, retry_count, lease_owner, leased_until";

/// Longest lease or redelivery delay, in seconds (ten years).
const MAX_DEADLINE_SECS: u64 = 315_360_000;

pub(crate) fn lease_deadline(now: DateTime<Utc>, lease_for: Duration) -> DateTime<Utc> {
    let secs = lease_for.as_secs().min(MAX_DEADLINE_SECS) as i64;
    let lease = chrono::Duration::seconds(secs)
        + chrono::Duration::nanoseconds(i64::from(lease_for.subsec_nanos()));
    now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Durable, leased job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a job on the action's pool unless an identical one is waiting.
    async fn enqueue(&self, activation_id: i64, action: JobAction) -> Result<EnqueueOutcome>;

    /// Claim the next job of `pool` for `owner`.
    async fn lease(&self, pool: PoolName, owner: &str, lease_for: Duration)
    -> Result<Option<Job>>;

    /// Push the lease of a held job forward. Returns false if the lease was lost.
    async fn extend_lease(&self, job_id: i64, owner: &str, lease_for: Duration) -> Result<bool>;

    /// Remove a finished job. Returns false if the lease was lost.
    async fn ack(&self, job_id: i64, owner: &str) -> Result<bool>;

    /// Release a held job for redelivery after `delay`.
    async fn retry(&self, job_id: i64, owner: &str, delay: Duration) -> Result<bool>;

    /// Whether any job with one of `actions` exists for an activation.
    async fn has_pending(&self, activation_id: i64, actions: &[JobAction]) -> Result<bool>;

    /// Activations that have any job, leased or waiting, on `pool`.
    async fn activations_with_jobs(&self, pool: PoolName) -> Result<Vec<i64>>;

    /// Delete every job of an activation except the one held by `keep`.
    async fn purge(&self, activation_id: i64, keep: Option<i64>) -> Result<u64>;

    /// Number of jobs on `pool`.
    async fn depth(&self, pool: PoolName) -> Result<u64>;
}
