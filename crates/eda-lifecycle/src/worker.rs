// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job handlers.
//!
//! [`ActivationWorker`] owns every lifecycle transition of an activation after
//! admission: it starts the container, supervises it for a bounded window,
//! applies the restart policy when it exits, and stops it on request.
//! [`MaintenanceWorker`] runs housekeeping on the default pool.
//!
//! Jobs are delivered at least once, so every handler first looks at what is
//! already recorded (an open instance, a live container) before acting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::activation::{
    Activation, ActivationInstance, ActivationStatus, DesiredState, EndReason, InstanceClose,
    Lifecycle,
};
use crate::admission::RunningSet;
use crate::config::Config;
use crate::container::{ContainerRuntime, ContainerSpec, ObservedStatus, RuntimeError};
use crate::error::{Error, Result};
use crate::log_relay::LogSink;
use crate::persistence::Persistence;
use crate::policy::{self, RestartSettings, RunOutcome};
use crate::queue::{Job, JobAction, JobQueue, PoolName};

/// Actions that preempt supervision of a running container.
const PREEMPTING: [JobAction; 3] = [JobAction::Stop, JobAction::Restart, JobAction::Delete];

/// Lease held by the handler of one job.
pub struct JobContext {
    queue: Arc<dyn JobQueue>,
    job_id: i64,
    owner: String,
    lease_for: Duration,
}

impl JobContext {
    /// Create a context for a leased job.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        job_id: i64,
        owner: impl Into<String>,
        lease_for: Duration,
    ) -> Self {
        Self {
            queue,
            job_id,
            owner: owner.into(),
            lease_for,
        }
    }

    /// Lease owner token.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Push the lease forward. Returns false if another worker took the job.
    pub async fn extend_lease(&self) -> Result<bool> {
        self.queue
            .extend_lease(self.job_id, &self.owner, self.lease_for)
            .await
    }
}

/// Handles jobs leased from one pool.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Pool this handler consumes.
    fn pool(&self) -> PoolName;

    /// Run one job.
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<()>;

    /// Called when a job is dropped after exhausting its retries.
    async fn on_dead_letter(&self, _job: &Job) -> Result<()> {
        Ok(())
    }
}

/// Timing and policy knobs of the activation worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Restart policy settings.
    pub restart: RestartSettings,
    /// How long one job supervises a container before handing off.
    pub monitor_window: Duration,
    /// Container observation cadence.
    pub poll_interval: Duration,
    /// Bound on container creation + start.
    pub start_timeout: Duration,
    /// Grace period when stopping a container.
    pub stop_grace: Duration,
}

impl From<&Config> for WorkerSettings {
    fn from(config: &Config) -> Self {
        Self {
            restart: RestartSettings::from(config),
            monitor_window: config.monitor_window,
            poll_interval: config.container_poll_interval,
            start_timeout: config.container_start_timeout,
            stop_grace: config.container_stop_grace,
        }
    }
}

/// State of an instance found open when a job arrives.
enum OpenRun {
    /// Its container is running.
    Live {
        instance: ActivationInstance,
        container_id: String,
    },
    /// Its container ended; `exit_code` is `None` when it vanished.
    Ended {
        instance: ActivationInstance,
        container_id: Option<String>,
        exit_code: Option<i64>,
    },
    /// A start was interrupted before a container existed; the instance has
    /// been closed.
    Interrupted,
}

/// Handler for the activation pool.
pub struct ActivationWorker {
    persistence: Arc<dyn Persistence>,
    queue: Arc<dyn JobQueue>,
    runtime: Arc<dyn ContainerRuntime>,
    logs: Arc<dyn LogSink>,
    running_set: RunningSet,
    settings: WorkerSettings,
}

impl ActivationWorker {
    /// Create a new activation worker.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        queue: Arc<dyn JobQueue>,
        runtime: Arc<dyn ContainerRuntime>,
        logs: Arc<dyn LogSink>,
        running_set: RunningSet,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            persistence,
            queue,
            runtime,
            logs,
            running_set,
            settings,
        }
    }

    async fn handle_start(&self, job: &Job, ctx: &JobContext) -> Result<()> {
        let Some(mut activation) = self.persistence.get_activation(job.activation_id).await?
        else {
            info!(activation_id = job.activation_id, "Activation gone, dropping start");
            return Ok(());
        };

        if let Some(open) = self.persistence.get_open_instance(activation.id).await? {
            match self.resolve_open(open).await? {
                OpenRun::Live {
                    instance,
                    container_id,
                } => {
                    self.adopt(&activation, &instance).await?;
                    self.queue.enqueue(activation.id, JobAction::Monitor).await?;
                    debug!(
                        activation_id = activation.id,
                        container_id = %container_id,
                        "Container already running, handed to monitor"
                    );
                    return Err(duplicate(job));
                }
                OpenRun::Ended {
                    instance,
                    container_id,
                    exit_code,
                } => {
                    self.handle_exit(&activation, &instance, container_id, exit_code, job)
                        .await?;
                    return Err(duplicate(job));
                }
                OpenRun::Interrupted => {
                    activation = self.reload(activation.id).await?;
                }
            }
        }

        if activation.status == ActivationStatus::Running {
            // Running without an open instance: the previous run was never
            // closed properly.
            return self
                .finish_run(&activation, RunOutcome::Failed, Some("container lost".into()))
                .await;
        }

        if activation.desired_state == DesiredState::Disabled {
            info!(activation_id = activation.id, "Activation disabled, dropping start");
            self.running_set.release(activation.id).await?;
            return Ok(());
        }
        if !activation.slot_held {
            warn!(activation_id = activation.id, "Start without a slot, dropping");
            return Ok(());
        }
        if !activation.status.is_admissible() {
            info!(
                activation_id = activation.id,
                status = %activation.status,
                "Activation not startable, releasing slot"
            );
            self.running_set.release(activation.id).await?;
            return Ok(());
        }

        let instance = match self
            .persistence
            .open_instance(activation.id, Utc::now())
            .await
        {
            Err(Error::InstanceAlreadyOpen { .. }) => return Err(duplicate(job)),
            other => other?,
        };

        let spec = ContainerSpec::for_activation(&activation, instance.id, instance.ordinal);
        let started =
            match tokio::time::timeout(self.settings.start_timeout, self.runtime.create_and_start(&spec))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(RuntimeError::Timeout),
            };

        let handle = match started {
            Ok(handle) => handle,
            Err(e) => return self.fail_start(&activation, &instance, e).await,
        };

        self.persistence
            .set_instance_container(instance.id, &handle.container_id)
            .await?;

        let from = activation.status;
        let status = from.transition(activation.id, ActivationStatus::Running)?;
        let lifecycle = Lifecycle {
            status,
            restart_count: activation.restart_count,
            last_start_at: Some(handle.started_at),
            last_exit_at: activation.last_exit_at,
            failure_reason: None,
            restart_after: None,
        };
        if !self
            .persistence
            .update_lifecycle(activation.id, from, &lifecycle)
            .await?
        {
            warn!(
                activation_id = activation.id,
                "Activation changed during start, stopping container"
            );
            self.runtime
                .stop_and_remove(&handle.container_id, self.settings.stop_grace)
                .await?;
            self.close(&instance, None, EndReason::Stopped, None).await?;
            self.running_set.release(activation.id).await?;
            return Ok(());
        }

        info!(
            activation_id = activation.id,
            instance_id = instance.id,
            container_id = %handle.container_id,
            ordinal = instance.ordinal,
            "Activation started"
        );

        self.attach_logs(activation.id, instance.id, &handle.container_id)
            .await;
        self.supervise(activation.id, instance, handle.container_id, job, ctx)
            .await
    }

    async fn handle_monitor(&self, job: &Job, ctx: &JobContext) -> Result<()> {
        let Some(activation) = self.persistence.get_activation(job.activation_id).await? else {
            return Ok(());
        };

        let Some(open) = self.persistence.get_open_instance(activation.id).await? else {
            if activation.status == ActivationStatus::Running {
                return self
                    .finish_run(&activation, RunOutcome::Failed, Some("container lost".into()))
                    .await;
            }
            debug!(activation_id = activation.id, "Nothing to monitor");
            return Ok(());
        };

        match self.resolve_open(open).await? {
            OpenRun::Live {
                instance,
                container_id,
            } => {
                self.adopt(&activation, &instance).await?;
                self.supervise(activation.id, instance, container_id, job, ctx)
                    .await
            }
            OpenRun::Ended {
                instance,
                container_id,
                exit_code,
            } => {
                self.handle_exit(&activation, &instance, container_id, exit_code, job)
                    .await
            }
            OpenRun::Interrupted => Ok(()),
        }
    }

    async fn handle_stop(&self, job: &Job) -> Result<()> {
        let Some(activation) = self.persistence.get_activation(job.activation_id).await? else {
            self.sweep(job.activation_id, None).await?;
            return Ok(());
        };
        self.stop_activation(&activation).await?;
        info!(activation_id = activation.id, "Activation stopped");
        Ok(())
    }

    async fn handle_restart(&self, job: &Job) -> Result<()> {
        let Some(activation) = self.persistence.get_activation(job.activation_id).await? else {
            return Ok(());
        };
        self.stop_activation(&activation).await?;
        info!(
            activation_id = activation.id,
            "Activation reset, awaiting admission"
        );
        Ok(())
    }

    async fn handle_delete(&self, job: &Job) -> Result<()> {
        let open = self.persistence.get_open_instance(job.activation_id).await?;
        let known = open.as_ref().and_then(|i| i.container_id.clone());
        self.sweep(job.activation_id, known.as_deref()).await?;

        let purged = self.queue.purge(job.activation_id, Some(job.id)).await?;
        let deleted = self.persistence.delete_activation(job.activation_id).await?;
        info!(
            activation_id = job.activation_id,
            deleted, purged, "Activation deleted"
        );
        Ok(())
    }

    /// Stop every container of the activation and land it in `Stopped`.
    async fn stop_activation(&self, activation: &Activation) -> Result<()> {
        let open = self.persistence.get_open_instance(activation.id).await?;
        let known = open.as_ref().and_then(|i| i.container_id.clone());
        self.sweep(activation.id, known.as_deref()).await?;

        let now = Utc::now();
        if let Some(instance) = &open {
            self.close(instance, None, EndReason::Stopped, None).await?;
        }

        let from = activation.status;
        let status = from.transition(activation.id, ActivationStatus::Stopped)?;
        let lifecycle = Lifecycle {
            status,
            restart_count: 0,
            last_start_at: activation.last_start_at,
            last_exit_at: if open.is_some() {
                Some(now)
            } else {
                activation.last_exit_at
            },
            failure_reason: activation.failure_reason.clone(),
            restart_after: None,
        };
        if !self
            .persistence
            .update_lifecycle(activation.id, from, &lifecycle)
            .await?
        {
            warn!(activation_id = activation.id, "Activation changed during stop");
        }
        self.running_set.release(activation.id).await
    }

    /// Figure out what happened to an instance left open.
    async fn resolve_open(&self, instance: ActivationInstance) -> Result<OpenRun> {
        if let Some(container_id) = instance.container_id.clone() {
            return Ok(match self.runtime.observe(&container_id).await? {
                ObservedStatus::Running => OpenRun::Live {
                    instance,
                    container_id,
                },
                ObservedStatus::Exited(code) => OpenRun::Ended {
                    instance,
                    container_id: Some(container_id),
                    exit_code: Some(code),
                },
                ObservedStatus::NotFound => OpenRun::Ended {
                    instance,
                    container_id: None,
                    exit_code: None,
                },
            });
        }

        // The start was interrupted before the container id was recorded.
        let managed = self
            .runtime
            .list_managed()
            .await?
            .into_iter()
            .find(|m| m.instance_id == Some(instance.id));

        match managed {
            Some(container) => {
                self.persistence
                    .set_instance_container(instance.id, &container.container_id)
                    .await?;
                if container.running {
                    Ok(OpenRun::Live {
                        instance,
                        container_id: container.container_id,
                    })
                } else {
                    let exit_code = match self.runtime.observe(&container.container_id).await? {
                        ObservedStatus::Exited(code) => Some(code),
                        _ => None,
                    };
                    Ok(OpenRun::Ended {
                        instance,
                        container_id: Some(container.container_id),
                        exit_code,
                    })
                }
            }
            None => {
                self.close(
                    &instance,
                    None,
                    EndReason::StartFailed,
                    Some("interrupted".to_string()),
                )
                .await?;
                info!(
                    activation_id = instance.activation_id,
                    instance_id = instance.id,
                    "Closed interrupted start"
                );
                Ok(OpenRun::Interrupted)
            }
        }
    }

    /// Record a live container found for an open instance as running.
    async fn adopt(&self, activation: &Activation, instance: &ActivationInstance) -> Result<()> {
        if activation.status == ActivationStatus::Running {
            return Ok(());
        }
        let from = activation.status;
        let status = from.transition(activation.id, ActivationStatus::Running)?;
        let lifecycle = Lifecycle {
            status,
            restart_count: activation.restart_count,
            last_start_at: Some(instance.started_at),
            last_exit_at: activation.last_exit_at,
            failure_reason: None,
            restart_after: None,
        };
        self.persistence
            .update_lifecycle(activation.id, from, &lifecycle)
            .await?;
        info!(
            activation_id = activation.id,
            instance_id = instance.id,
            "Adopted running container"
        );
        Ok(())
    }

    /// Poll a container until it exits, the window ends, or a stop preempts.
    async fn supervise(
        &self,
        activation_id: i64,
        instance: ActivationInstance,
        container_id: String,
        job: &Job,
        ctx: &JobContext,
    ) -> Result<()> {
        let deadline = Instant::now() + self.settings.monitor_window;

        loop {
            match self.runtime.observe(&container_id).await {
                Ok(ObservedStatus::Running) => {}
                Ok(ObservedStatus::Exited(code)) => {
                    let activation = self.reload(activation_id).await?;
                    return self
                        .handle_exit(&activation, &instance, Some(container_id), Some(code), job)
                        .await;
                }
                Ok(ObservedStatus::NotFound) => {
                    let activation = self.reload(activation_id).await?;
                    return self
                        .handle_exit(&activation, &instance, None, None, job)
                        .await;
                }
                Err(e) if e.is_transient() => {
                    warn!(activation_id, error = %e, "Container observation failed");
                }
                Err(e) => return Err(e.into()),
            }

            if self.queue.has_pending(activation_id, &PREEMPTING).await? {
                debug!(activation_id, "Supervision preempted");
                return Ok(());
            }
            match self.persistence.get_activation(activation_id).await? {
                Some(a) if a.desired_state == DesiredState::Enabled => {}
                _ => {
                    debug!(activation_id, "Activation disabled, ending supervision");
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                self.queue.enqueue(activation_id, JobAction::Monitor).await?;
                debug!(activation_id, "Monitor window elapsed, handed off");
                return Ok(());
            }

            if !ctx.extend_lease().await? {
                warn!(activation_id, job_id = job.id, "Lease lost during supervision");
                return Ok(());
            }

            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Close the run of an ended container and apply the restart policy.
    async fn handle_exit(
        &self,
        activation: &Activation,
        instance: &ActivationInstance,
        container_id: Option<String>,
        exit_code: Option<i64>,
        job: &Job,
    ) -> Result<()> {
        let (end_reason, outcome, reason) = match exit_code {
            Some(0) => (EndReason::Exited, RunOutcome::Clean, None),
            Some(code) => (
                EndReason::Exited,
                RunOutcome::Failed,
                Some(format!("container exited with code {code}")),
            ),
            None => (
                EndReason::Lost,
                RunOutcome::Failed,
                Some("container lost".to_string()),
            ),
        };

        if !self
            .close(instance, exit_code, end_reason, reason.clone())
            .await?
        {
            return Err(duplicate(job));
        }

        if let Some(container_id) = container_id
            && let Err(e) = self
                .runtime
                .stop_and_remove(&container_id, self.settings.stop_grace)
                .await
        {
            warn!(
                activation_id = activation.id,
                container_id = %container_id,
                error = %e,
                "Failed to remove exited container"
            );
        }

        info!(
            activation_id = activation.id,
            instance_id = instance.id,
            exit_code = ?exit_code,
            "Activation container ended"
        );
        self.finish_run(activation, outcome, reason).await
    }

    async fn fail_start(
        &self,
        activation: &Activation,
        instance: &ActivationInstance,
        err: RuntimeError,
    ) -> Result<()> {
        let reason = err.to_string();
        warn!(
            activation_id = activation.id,
            instance_id = instance.id,
            error = %err,
            "Activation failed to start"
        );
        self.close(instance, None, EndReason::StartFailed, Some(reason.clone()))
            .await?;

        if matches!(err, RuntimeError::Timeout) {
            // The engine may still create the container after we gave up.
            self.sweep_instance(activation.id, instance.id).await;
        }

        let outcome = if err.counts_against_retry_cap() {
            RunOutcome::Failed
        } else {
            RunOutcome::Infrastructure
        };
        self.finish_run(activation, outcome, Some(reason)).await
    }

    /// Apply the restart policy, release the slot and schedule history pruning.
    async fn finish_run(
        &self,
        activation: &Activation,
        outcome: RunOutcome,
        reason: Option<String>,
    ) -> Result<()> {
        let now = Utc::now();
        let decision = policy::decide(activation, outcome, self.settings.restart, now);

        let from = activation.status;
        let status = end_status(activation.id, from, outcome, decision.is_errored())?;
        let lifecycle = Lifecycle {
            status,
            restart_count: decision.restart_count,
            last_start_at: activation.last_start_at,
            last_exit_at: Some(now),
            failure_reason: reason,
            restart_after: decision.restart_after,
        };

        if !self
            .persistence
            .update_lifecycle(activation.id, from, &lifecycle)
            .await?
        {
            warn!(activation_id = activation.id, "Activation changed before exit was recorded");
        } else if decision.is_errored() {
            error!(
                activation_id = activation.id,
                restart_count = decision.restart_count,
                "Activation exceeded restart limit"
            );
        } else {
            debug!(
                activation_id = activation.id,
                status = %status,
                restart_after = ?decision.restart_after,
                "Restart policy applied"
            );
        }

        self.running_set.release(activation.id).await?;
        self.queue
            .enqueue(activation.id, JobAction::PruneHistory)
            .await?;
        Ok(())
    }

    async fn close(
        &self,
        instance: &ActivationInstance,
        exit_code: Option<i64>,
        end_reason: EndReason,
        failure_reason: Option<String>,
    ) -> Result<bool> {
        self.persistence
            .close_instance(
                instance.id,
                &InstanceClose {
                    ended_at: Utc::now(),
                    exit_code,
                    end_reason,
                    failure_reason,
                },
            )
            .await
    }

    /// Stop and remove `known` plus every labelled container of the activation.
    async fn sweep(&self, activation_id: i64, known: Option<&str>) -> Result<usize> {
        let mut containers: Vec<String> = known.map(str::to_string).into_iter().collect();
        for managed in self.runtime.list_managed().await? {
            if managed.activation_id == activation_id && !containers.contains(&managed.container_id)
            {
                containers.push(managed.container_id);
            }
        }
        for container_id in &containers {
            self.runtime
                .stop_and_remove(container_id, self.settings.stop_grace)
                .await?;
        }
        Ok(containers.len())
    }

    async fn sweep_instance(&self, activation_id: i64, instance_id: i64) {
        let managed = match self.runtime.list_managed().await {
            Ok(managed) => managed,
            Err(e) => {
                warn!(activation_id, error = %e, "Could not list containers after timeout");
                return;
            }
        };
        for container in managed
            .into_iter()
            .filter(|m| m.instance_id == Some(instance_id))
        {
            if let Err(e) = self
                .runtime
                .stop_and_remove(&container.container_id, self.settings.stop_grace)
                .await
            {
                warn!(activation_id, error = %e, "Failed to remove late container");
            }
        }
    }

    async fn attach_logs(&self, activation_id: i64, instance_id: i64, container_id: &str) {
        match self.runtime.logs(container_id).await {
            Ok(lines) => {
                self.logs.attach(activation_id, instance_id, lines);
            }
            Err(e) => warn!(activation_id, error = %e, "Could not follow container logs"),
        }
    }

    async fn reload(&self, activation_id: i64) -> Result<Activation> {
        self.persistence
            .get_activation(activation_id)
            .await?
            .ok_or(Error::ActivationNotFound(activation_id))
    }
}

/// Status after a run ends, walking the state machine from `from`.
fn end_status(
    activation_id: i64,
    from: ActivationStatus,
    outcome: RunOutcome,
    errored: bool,
) -> Result<ActivationStatus> {
    let target = match outcome {
        RunOutcome::Clean => ActivationStatus::Completed,
        RunOutcome::Failed | RunOutcome::Infrastructure => ActivationStatus::Failed,
    };
    // A container that ran before its Running status was written still
    // passes through Running.
    let mut status = from;
    if outcome == RunOutcome::Clean && from != ActivationStatus::Running {
        status = status.transition(activation_id, ActivationStatus::Running)?;
    }
    status = status.transition(activation_id, target)?;
    if errored {
        status = status.transition(activation_id, ActivationStatus::Errored)?;
    }
    Ok(status)
}

fn duplicate(job: &Job) -> Error {
    Error::LeaseExpiredDuplicate {
        job_id: job.id,
        activation_id: job.activation_id,
    }
}

#[async_trait]
impl JobHandler for ActivationWorker {
    fn pool(&self) -> PoolName {
        PoolName::Activation
    }

    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<()> {
        match job.action {
            JobAction::Start => self.handle_start(job, ctx).await,
            JobAction::Monitor => self.handle_monitor(job, ctx).await,
            JobAction::Stop => self.handle_stop(job).await,
            JobAction::Restart => self.handle_restart(job).await,
            JobAction::Delete => self.handle_delete(job).await,
            JobAction::PruneHistory => Err(Error::Other(format!(
                "job {} routed to the wrong pool",
                job.id
            ))),
        }
    }

    async fn on_dead_letter(&self, job: &Job) -> Result<()> {
        if job.action != JobAction::Start {
            return Ok(());
        }

        // A container may be up even though its supervision failed; the slot
        // stays until a later job records the run as ended.
        let running = self
            .persistence
            .get_activation(job.activation_id)
            .await?
            .is_some_and(|a| a.status == ActivationStatus::Running);
        let has_container = self
            .persistence
            .get_open_instance(job.activation_id)
            .await?
            .is_some_and(|i| i.container_id.is_some());
        if running || has_container {
            warn!(
                activation_id = job.activation_id,
                job_id = job.id,
                "Start dead-lettered with a live run, slot kept"
            );
            return Ok(());
        }

        self.running_set.release(job.activation_id).await
    }
}

/// Handler for the default pool.
pub struct MaintenanceWorker {
    persistence: Arc<dyn Persistence>,
    history_limit: u32,
}

impl MaintenanceWorker {
    /// Create a maintenance worker keeping `history_limit` closed instances.
    pub fn new(persistence: Arc<dyn Persistence>, history_limit: u32) -> Self {
        Self {
            persistence,
            history_limit,
        }
    }
}

#[async_trait]
impl JobHandler for MaintenanceWorker {
    fn pool(&self) -> PoolName {
        PoolName::Default
    }

    async fn handle(&self, job: &Job, _ctx: &JobContext) -> Result<()> {
        match job.action {
            JobAction::PruneHistory => {
                let pruned = self
                    .persistence
                    .prune_instances(job.activation_id, self.history_limit)
                    .await?;
                if pruned > 0 {
                    debug!(activation_id = job.activation_id, pruned, "Pruned instance history");
                }
                Ok(())
            }
            other => Err(Error::Other(format!(
                "{other} job {} routed to the default pool",
                job.id
            ))),
        }
    }
}
