// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool loop.
//!
//! One loop per pool identity leases jobs and runs them on a [`JobHandler`]
//! under a semaphore sized by the pool's concurrency. The outcome of each
//! handler decides what happens to the job:
//!
//! - success: ack
//! - redelivered duplicate: ack, logged at info
//! - transient failure: released for redelivery with exponential backoff
//! - anything else, or too many deliveries: dead-lettered (ack + error log)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::queue::{Job, JobQueue};
use crate::worker::{JobContext, JobHandler};

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Concurrent handlers.
    pub concurrency: usize,
    /// Lease taken on each job.
    pub lease_for: Duration,
    /// Deliveries before a job is dead-lettered.
    pub max_retries: u32,
    /// Sleep when the queue is empty.
    pub idle_poll: Duration,
    /// Base delay before a failed job is redelivered.
    pub retry_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            lease_for: Duration::from_secs(300),
            max_retries: 5,
            idle_poll: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(2),
        }
    }
}

impl WorkerPoolConfig {
    /// Pool settings for the default or activation pool.
    pub fn from_config(config: &Config, concurrency: usize) -> Self {
        Self {
            concurrency,
            lease_for: config.job_lease,
            max_retries: config.job_max_retries,
            ..Self::default()
        }
    }

    fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count.min(16));
        self.retry_backoff
            .saturating_mul(factor)
            .min(MAX_RETRY_BACKOFF)
    }
}

/// What the pool did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// The handler succeeded.
    Acked,
    /// The job was a redelivery of work already done.
    Duplicate,
    /// The job will be redelivered.
    Retried,
    /// The job was dropped.
    DeadLettered,
}

/// Leases and runs jobs of one pool.
pub struct WorkerPool<H: JobHandler> {
    handler: Arc<H>,
    queue: Arc<dyn JobQueue>,
    config: WorkerPoolConfig,
    worker_id: String,
    shutdown: Arc<Notify>,
}

impl<H: JobHandler> WorkerPool<H> {
    /// Create a new worker pool.
    pub fn new(handler: Arc<H>, queue: Arc<dyn JobQueue>, config: WorkerPoolConfig) -> Self {
        let worker_id = format!(
            "{}-{}",
            handler.pool().as_str(),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        Self {
            handler,
            queue,
            config,
            worker_id,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Identity used in lease owner tokens.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run the pool until shutdown, then drain in-flight handlers.
    pub async fn run(&self) {
        let pool = self.handler.pool();
        info!(
            pool = %pool,
            worker_id = %self.worker_id,
            concurrency = self.config.concurrency,
            "Worker pool started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut in_flight = JoinSet::new();

        loop {
            while in_flight.try_join_next().is_some() {}

            let permit = tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(pool = %pool, "Worker pool received shutdown signal");
                    break;
                }

                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let owner = self.owner_token();
            match self.queue.lease(pool, &owner, self.config.lease_for).await {
                Ok(Some(job)) => {
                    let handler = self.handler.clone();
                    let queue = self.queue.clone();
                    let config = self.config.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        process(handler.as_ref(), queue, &config, job, owner).await
                    });
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(pool = %pool, error = %e, "Failed to lease job");
                }
            }
            drop(permit);

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(pool = %pool, "Worker pool received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.idle_poll) => {}
            }
        }

        let draining = in_flight.len();
        if draining > 0 {
            info!(pool = %pool, draining, "Waiting for in-flight jobs");
        }
        while in_flight.join_next().await.is_some() {}

        info!(pool = %pool, "Worker pool stopped");
    }

    /// Lease and run a single job inline.
    pub async fn process_next(&self) -> Result<Option<Processed>> {
        let owner = self.owner_token();
        let Some(job) = self
            .queue
            .lease(self.handler.pool(), &owner, self.config.lease_for)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(
            process(
                self.handler.as_ref(),
                self.queue.clone(),
                &self.config,
                job,
                owner,
            )
            .await,
        ))
    }

    fn owner_token(&self) -> String {
        format!("{}:{}", self.worker_id, Uuid::new_v4().simple())
    }
}

async fn process<H: JobHandler>(
    handler: &H,
    queue: Arc<dyn JobQueue>,
    config: &WorkerPoolConfig,
    job: Job,
    owner: String,
) -> Processed {
    debug!(
        job_id = job.id,
        activation_id = job.activation_id,
        action = %job.action,
        retry_count = job.retry_count,
        "Processing job"
    );

    let ctx = JobContext::new(queue.clone(), job.id, owner.clone(), config.lease_for);
    let result = handler.handle(&job, &ctx).await;

    let processed = match result {
        Ok(()) => {
            ack(queue.as_ref(), &job, &owner).await;
            Processed::Acked
        }
        Err(Error::LeaseExpiredDuplicate {
            job_id,
            activation_id,
        }) => {
            info!(job_id, activation_id, action = %job.action, "Duplicate delivery, acknowledged");
            ack(queue.as_ref(), &job, &owner).await;
            Processed::Duplicate
        }
        Err(e) if e.is_transient() && job.retry_count < config.max_retries => {
            let delay = config.backoff(job.retry_count);
            warn!(
                job_id = job.id,
                activation_id = job.activation_id,
                action = %job.action,
                retry_count = job.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "Job failed, will retry"
            );
            match queue.retry(job.id, &owner, delay).await {
                Ok(true) => {}
                Ok(false) => warn!(job_id = job.id, "Lease lost before retry"),
                Err(e) => error!(job_id = job.id, error = %e, "Failed to release job for retry"),
            }
            Processed::Retried
        }
        Err(e) => {
            error!(
                job_id = job.id,
                activation_id = job.activation_id,
                action = %job.action,
                retry_count = job.retry_count,
                error = %e,
                "Job dead-lettered"
            );
            if let Err(e) = handler.on_dead_letter(&job).await {
                error!(job_id = job.id, error = %e, "Dead-letter cleanup failed");
            }
            ack(queue.as_ref(), &job, &owner).await;
            Processed::DeadLettered
        }
    };

    processed
}

async fn ack(queue: &dyn JobQueue, job: &Job, owner: &str) {
    match queue.ack(job.id, owner).await {
        Ok(true) => {}
        Ok(false) => warn!(job_id = job.id, "Lease lost before ack"),
        Err(e) => error!(job_id = job.id, error = %e, "Failed to ack job"),
    }
}
