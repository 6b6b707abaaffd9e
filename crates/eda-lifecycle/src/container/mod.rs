// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime adapter.
//!
//! Workers drive activation containers through the [`ContainerRuntime`] trait.
//! Runtimes are pure execution engines: they never touch the state store.

pub mod mock;
pub mod podman;

pub use mock::MockRuntime;
pub use podman::PodmanRuntime;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use thiserror::Error;

use crate::activation::Activation;

/// Label carrying the owning activation id.
pub const LABEL_ACTIVATION_ID: &str = "eda.activation_id";
/// Label carrying the instance id.
pub const LABEL_INSTANCE_ID: &str = "eda.instance_id";

/// Errors from runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The control socket could not be reached.
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// The engine rejected the container spec (bad image, resource limits).
    #[error("Container spec rejected: {0}")]
    SpawnRejected(String),

    /// The operation did not finish in time.
    #[error("Container operation timed out")]
    Timeout,

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

impl RuntimeError {
    /// Whether a start failure with this error counts against the restart cap.
    ///
    /// Only a rejected spec is the activation's fault; transport problems are
    /// infrastructure failures.
    pub fn counts_against_retry_cap(&self) -> bool {
        matches!(self, RuntimeError::SpawnRejected(_) | RuntimeError::Other(_))
    }

    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RuntimeError::RuntimeUnavailable(_) | RuntimeError::Timeout
        )
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Everything the engine needs to create an activation container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Container name, unique per instance.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Command; empty keeps the image default.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Labels used to find managed containers again.
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Spec for the `ordinal`-th run of an activation.
    pub fn for_activation(activation: &Activation, instance_id: i64, ordinal: i32) -> Self {
        let mut env: HashMap<String, String> = activation
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.insert("EDA_ACTIVATION_ID".to_string(), activation.id.to_string());
        env.insert("EDA_ACTIVATION_INSTANCE_ID".to_string(), instance_id.to_string());

        let labels = HashMap::from([
            (LABEL_ACTIVATION_ID.to_string(), activation.id.to_string()),
            (LABEL_INSTANCE_ID.to_string(), instance_id.to_string()),
        ]);

        Self {
            name: format!("eda-activation-{}-{}", activation.id, ordinal),
            image: activation.image.clone(),
            command: activation.command.clone(),
            env,
            labels,
        }
    }
}

/// Handle for a started container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerHandle {
    /// Runtime-assigned container id.
    pub container_id: String,
    /// Container name.
    pub name: String,
    /// When the container was started.
    pub started_at: DateTime<Utc>,
}

/// Observed container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedStatus {
    /// Still running.
    Running,
    /// Terminated with an exit code.
    Exited(i64),
    /// The runtime does not know the container.
    NotFound,
}

/// A container carrying the activation label.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedContainer {
    /// Runtime-assigned container id.
    pub container_id: String,
    /// Owning activation.
    pub activation_id: i64,
    /// Instance the container was created for.
    pub instance_id: Option<i64>,
    /// Whether the container is running.
    pub running: bool,
}

/// Follow stream of container log lines.
pub type LogStream = BoxStream<'static, Result<String>>;

/// Trait for container runtimes.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime type identifier (e.g. "podman", "mock")
    fn runtime_type(&self) -> &'static str;

    /// Create and start a container.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    /// Non-blocking status poll.
    async fn observe(&self, container_id: &str) -> Result<ObservedStatus>;

    /// Stop and remove a container. Removing an unknown container succeeds.
    async fn stop_and_remove(&self, container_id: &str, grace: Duration) -> Result<()>;

    /// List every container carrying the activation label.
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>>;

    /// Follow the container's combined stdout/stderr.
    async fn logs(&self, container_id: &str) -> Result<LogStream>;

    /// Check that the control socket answers.
    async fn ping(&self) -> Result<()>;
}

/// Parse the activation/instance labels of a container.
pub(crate) fn parse_labels(
    labels: &HashMap<String, String>,
) -> Option<(i64, Option<i64>)> {
    let activation_id = labels.get(LABEL_ACTIVATION_ID)?.parse().ok()?;
    let instance_id = labels
        .get(LABEL_INSTANCE_ID)
        .and_then(|v| v.parse().ok());
    Some((activation_id, instance_id))
}
