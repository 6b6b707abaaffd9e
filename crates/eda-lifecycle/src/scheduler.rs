// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activation scheduler.
//!
//! Each tick compares what users want (desired state, restart timers) with
//! what is recorded and issues corrective jobs: starts up to the global cap,
//! stops for disabled activations, monitors for running activations whose
//! supervising job was lost. The scheduler talks to the container engine
//! only during startup recovery, which is retried every tick until the
//! engine answers; no activation is admitted before then.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::activation::{Activation, ActivationStatus, DesiredState};
use crate::admission::RunningSet;
use crate::container::{ContainerRuntime, ManagedContainer};
use crate::error::{Error, Result};
use crate::persistence::Persistence;
use crate::queue::{JobAction, JobQueue, PoolName};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between reconciliation passes
    pub interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// Jobs issued by one reconciliation pass, by activation id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Admitted and sent a Start job.
    pub admitted: Vec<i64>,
    /// Due but left for a later tick because the cap was reached.
    pub deferred: Vec<i64>,
    /// Sent a Stop job.
    pub stopped: Vec<i64>,
    /// Sent a Monitor job.
    pub monitored: Vec<i64>,
    /// Stale slots released.
    pub released: Vec<i64>,
    /// Running activations that had lost their slot and got it back.
    pub reclaimed: Vec<i64>,
}

/// Result of startup recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Slots held after the rebuild.
    pub held: u32,
    /// Sent a Monitor job.
    pub monitored: Vec<i64>,
    /// Sent a Stop job.
    pub stopped: Vec<i64>,
}

struct StartupRecovery {
    runtime: Arc<dyn ContainerRuntime>,
    stop_grace: Duration,
    done: AtomicBool,
}

/// Periodic reconciliation loop.
pub struct Scheduler {
    persistence: Arc<dyn Persistence>,
    queue: Arc<dyn JobQueue>,
    running_set: RunningSet,
    config: SchedulerConfig,
    recovery: Option<StartupRecovery>,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        queue: Arc<dyn JobQueue>,
        running_set: RunningSet,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            persistence,
            queue,
            running_set,
            config,
            recovery: None,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Recover from the container engine before admitting anything.
    ///
    /// Until [`recover_from_engine`](Self::recover_from_engine) succeeds,
    /// every tick retries it and due activations are deferred.
    pub fn with_startup_recovery(
        mut self,
        runtime: Arc<dyn ContainerRuntime>,
        stop_grace: Duration,
    ) -> Self {
        self.recovery = Some(StartupRecovery {
            runtime,
            stop_grace,
            done: AtomicBool::new(false),
        });
        self
    }

    /// Whether startup recovery is still outstanding.
    pub fn recovery_pending(&self) -> bool {
        self.recovery
            .as_ref()
            .is_some_and(|r| !r.done.load(Ordering::SeqCst))
    }

    /// Remove orphaned containers, then rebuild the running set from the
    /// containers the engine reports.
    ///
    /// Returns `None` when no startup recovery is configured.
    pub async fn recover_from_engine(&self) -> Result<Option<RecoveryReport>> {
        let Some(recovery) = &self.recovery else {
            return Ok(None);
        };
        let observed = remove_orphans(
            self.persistence.as_ref(),
            recovery.runtime.as_ref(),
            recovery.stop_grace,
        )
        .await?;
        let report = self.recover(&observed).await?;
        recovery.done.store(true, Ordering::SeqCst);
        Ok(Some(report))
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the scheduler loop.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            cap = self.running_set.cap(),
            "Scheduler started"
        );

        loop {
            if self.recovery_pending()
                && let Err(e) = self.recover_from_engine().await
            {
                warn!(error = %e, "Startup recovery failed, retrying next tick");
            }

            match self.tick().await {
                Ok(report) => {
                    if report != TickReport::default() {
                        debug!(?report, "Reconciliation pass finished");
                    }
                }
                Err(Error::PersistenceUnavailable(reason)) => {
                    warn!(reason = %reason, "State store unavailable, skipping tick");
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation pass failed");
                }
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }

    /// Run one reconciliation pass now.
    pub async fn tick(&self) -> Result<TickReport> {
        self.reconcile_at(Utc::now()).await
    }

    /// Run one reconciliation pass as of `now`.
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let activations = self.persistence.list_activations().await?;
        let with_jobs: HashSet<i64> = self
            .queue
            .activations_with_jobs(PoolName::Activation)
            .await?
            .into_iter()
            .collect();

        let mut report = TickReport::default();
        let mut cap_reached = self.recovery_pending();

        // Running activations without a slot are counted before anything
        // new is admitted.
        let unslotted = activations.iter().filter(|a| {
            a.status == ActivationStatus::Running
                && !a.slot_held
                && a.desired_state == DesiredState::Enabled
        });
        for activation in unslotted {
            match self.reclaim_slot(activation, &mut cap_reached, &mut report).await {
                Ok(()) => {}
                Err(e @ Error::PersistenceUnavailable(_)) => return Err(e),
                Err(e) => {
                    error!(activation_id = activation.id, error = %e, "Failed to reclaim slot");
                }
            }
        }

        for activation in &activations {
            if report.stopped.contains(&activation.id) {
                continue;
            }
            let result = self
                .reconcile_one(
                    activation,
                    with_jobs.contains(&activation.id),
                    now,
                    &mut cap_reached,
                    &mut report,
                )
                .await;
            match result {
                Ok(()) => {}
                Err(e @ Error::PersistenceUnavailable(_)) => return Err(e),
                Err(e) => {
                    error!(activation_id = activation.id, error = %e, "Failed to reconcile activation");
                }
            }
        }

        if !report.admitted.is_empty() || !report.deferred.is_empty() {
            info!(
                admitted = report.admitted.len(),
                deferred = report.deferred.len(),
                "Admission pass"
            );
        }
        Ok(report)
    }

    async fn reclaim_slot(
        &self,
        activation: &Activation,
        cap_reached: &mut bool,
        report: &mut TickReport,
    ) -> Result<()> {
        let id = activation.id;
        if self.running_set.try_admit(id).await? {
            warn!(activation_id = id, "Running activation held no slot, slot reclaimed");
            report.reclaimed.push(id);
            return Ok(());
        }

        *cap_reached = true;
        self.queue.enqueue(id, JobAction::Stop).await?;
        warn!(
            activation_id = id,
            cap = self.running_set.cap(),
            "Running activation over the cap, stop queued"
        );
        report.stopped.push(id);
        Ok(())
    }

    async fn reconcile_one(
        &self,
        activation: &Activation,
        has_job: bool,
        now: DateTime<Utc>,
        cap_reached: &mut bool,
        report: &mut TickReport,
    ) -> Result<()> {
        let id = activation.id;

        // Whatever job is queued runs first; handlers drop work for a
        // disabled activation, and the next tick sees what is left.
        if has_job {
            return Ok(());
        }

        if activation.desired_state == DesiredState::Disabled {
            let needs_stop = activation.status == ActivationStatus::Running
                || activation.restart_after.is_some();
            if needs_stop {
                self.queue.enqueue(id, JobAction::Stop).await?;
                report.stopped.push(id);
                return Ok(());
            }
        }

        if activation.status == ActivationStatus::Running {
            self.queue.enqueue(id, JobAction::Monitor).await?;
            info!(activation_id = id, "Running activation unsupervised, monitor queued");
            report.monitored.push(id);
            return Ok(());
        }

        if activation.slot_held {
            self.running_set.release(id).await?;
            info!(activation_id = id, status = %activation.status, "Released stale slot");
            report.released.push(id);
            return Ok(());
        }

        if !activation.is_due(now) {
            return Ok(());
        }
        if *cap_reached {
            report.deferred.push(id);
            return Ok(());
        }
        if !self.running_set.try_admit(id).await? {
            *cap_reached = true;
            report.deferred.push(id);
            debug!(activation_id = id, cap = self.running_set.cap(), "Cap reached, deferring");
            return Ok(());
        }

        if let Err(e) = self.queue.enqueue(id, JobAction::Start).await {
            self.running_set.release(id).await?;
            return Err(e);
        }
        info!(activation_id = id, status = %activation.status, "Activation admitted");
        report.admitted.push(id);
        Ok(())
    }

    /// Rebuild admission state from containers observed at startup.
    ///
    /// Running activations get a Monitor job so supervision resumes. A
    /// container whose activation is disabled, or above the cap, gets a Stop
    /// and holds no slot.
    pub async fn recover(&self, observed: &[ManagedContainer]) -> Result<RecoveryReport> {
        let activations = self.persistence.list_activations().await?;
        let live: BTreeSet<i64> = observed
            .iter()
            .filter(|c| c.running)
            .map(|c| c.activation_id)
            .collect();

        let mut keep = Vec::new();
        let mut report = RecoveryReport::default();
        for activation in activations.iter().filter(|a| live.contains(&a.id)) {
            let admissible = activation.desired_state == DesiredState::Enabled
                && keep.len() < self.running_set.cap() as usize;
            if admissible {
                keep.push(activation.id);
            } else {
                self.queue.enqueue(activation.id, JobAction::Stop).await?;
                report.stopped.push(activation.id);
            }
        }

        report.held = self.running_set.rebuild(&keep).await?;

        for activation in &activations {
            let supervise =
                keep.contains(&activation.id) || activation.status == ActivationStatus::Running;
            if supervise && !report.stopped.contains(&activation.id) {
                self.queue.enqueue(activation.id, JobAction::Monitor).await?;
                report.monitored.push(activation.id);
            }
        }

        info!(
            observed = live.len(),
            held = report.held,
            monitored = report.monitored.len(),
            stopped = report.stopped.len(),
            "Recovered running set"
        );
        Ok(report)
    }
}

/// Remove labelled containers that no open instance accounts for, and return
/// the rest.
///
/// These are containers of deleted activations, or of runs whose start was
/// abandoned after a timeout.
async fn remove_orphans(
    persistence: &dyn Persistence,
    runtime: &dyn ContainerRuntime,
    stop_grace: Duration,
) -> Result<Vec<ManagedContainer>> {
    let observed = runtime.list_managed().await?;

    let mut open = HashMap::new();
    for activation in persistence.list_activations().await? {
        if let Some(instance) = persistence.get_open_instance(activation.id).await? {
            open.insert(activation.id, instance);
        }
    }

    let mut kept = Vec::with_capacity(observed.len());
    for container in observed {
        let accounted = open.get(&container.activation_id).is_some_and(|instance| {
            container.instance_id == Some(instance.id)
                || instance.container_id.as_deref() == Some(container.container_id.as_str())
        });
        if accounted {
            kept.push(container);
            continue;
        }

        info!(
            activation_id = container.activation_id,
            container_id = %container.container_id,
            "Removing orphaned container"
        );
        if let Err(e) = runtime
            .stop_and_remove(&container.container_id, stop_grace)
            .await
        {
            warn!(
                container_id = %container.container_id,
                error = %e,
                "Failed to remove orphaned container"
            );
        }
    }
    Ok(kept)
}
