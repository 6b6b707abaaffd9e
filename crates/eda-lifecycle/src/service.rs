// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control operations on activations.
//!
//! These are the calls an API layer makes. They only record intent and queue
//! jobs; containers are touched by the activation workers.

use std::sync::Arc;

use tracing::info;

use crate::activation::{Activation, ActivationInstance, ActivationStatus, DesiredState, NewActivation};
use crate::error::{Error, Result};
use crate::persistence::Persistence;
use crate::queue::{EnqueueOutcome, JobAction, JobQueue};

/// Activation control surface.
#[derive(Clone)]
pub struct ActivationService {
    persistence: Arc<dyn Persistence>,
    queue: Arc<dyn JobQueue>,
}

impl ActivationService {
    /// Create a new service.
    pub fn new(persistence: Arc<dyn Persistence>, queue: Arc<dyn JobQueue>) -> Self {
        Self { persistence, queue }
    }

    /// Register an activation. An enabled one is picked up by the next tick.
    pub async fn create(&self, new: &NewActivation) -> Result<Activation> {
        let activation = self.persistence.create_activation(new).await?;
        info!(
            activation_id = activation.id,
            name = %activation.name,
            desired_state = activation.desired_state.as_str(),
            "Activation created"
        );
        Ok(activation)
    }

    /// Look up one activation.
    pub async fn get(&self, id: i64) -> Result<Activation> {
        self.persistence
            .get_activation(id)
            .await?
            .ok_or(Error::ActivationNotFound(id))
    }

    /// All activations, by ascending id.
    pub async fn list(&self) -> Result<Vec<Activation>> {
        self.persistence.list_activations().await
    }

    /// Run history, newest first.
    pub async fn instances(&self, id: i64) -> Result<Vec<ActivationInstance>> {
        self.get(id).await?;
        self.persistence.list_instances(id).await
    }

    /// Ask for the activation to run.
    ///
    /// An errored activation, or one whose last run ended without a restart
    /// timer, is reset through a Restart job so the scheduler admits it again.
    pub async fn enable(&self, id: i64) -> Result<Activation> {
        let activation = self.get(id).await?;
        self.persistence
            .set_desired_state(id, DesiredState::Enabled)
            .await?;

        let parked = matches!(
            activation.status,
            ActivationStatus::Completed | ActivationStatus::Failed
        ) && activation.restart_after.is_none();
        if activation.status == ActivationStatus::Errored || parked {
            self.queue.enqueue(id, JobAction::Restart).await?;
        }
        info!(activation_id = id, status = %activation.status, "Activation enabled");
        self.get(id).await
    }

    /// Ask for the activation to stop and stay stopped.
    pub async fn disable(&self, id: i64) -> Result<Activation> {
        self.get(id).await?;
        self.persistence
            .set_desired_state(id, DesiredState::Disabled)
            .await?;
        let job = self.queue.enqueue(id, JobAction::Stop).await?;
        info!(activation_id = id, job_id = job.job_id(), "Activation disabled");
        self.get(id).await
    }

    /// Stop the current run, reset the failure count and start again.
    pub async fn restart(&self, id: i64) -> Result<EnqueueOutcome> {
        self.get(id).await?;
        self.persistence
            .set_desired_state(id, DesiredState::Enabled)
            .await?;
        let job = self.queue.enqueue(id, JobAction::Restart).await?;
        info!(activation_id = id, job_id = job.job_id(), "Activation restart requested");
        Ok(job)
    }

    /// Stop the activation and remove it with its history.
    pub async fn delete(&self, id: i64) -> Result<EnqueueOutcome> {
        self.get(id).await?;
        self.persistence
            .set_desired_state(id, DesiredState::Disabled)
            .await?;
        let job = self.queue.enqueue(id, JobAction::Delete).await?;
        info!(activation_id = id, job_id = job.job_id(), "Activation delete requested");
        Ok(job)
    }
}
