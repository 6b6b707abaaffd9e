// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Podman runtime.
//!
//! Talks to the Docker-compatible API that podman exposes on its control
//! socket. Containers are labelled with the activation and instance ids so
//! they can be found again after a restart of the manager.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    errors::Error as BollardError,
    models::{ContainerCreateBody, HostConfig},
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
        ListContainersOptionsBuilder, LogsOptionsBuilder, RemoveContainerOptionsBuilder,
        StartContainerOptions, StopContainerOptionsBuilder,
    },
};
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use super::*;

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Runtime backed by a podman (or Docker) control socket.
pub struct PodmanRuntime {
    docker: Docker,
    endpoint: String,
}

impl PodmanRuntime {
    /// Connect to `socket_url`, or to the local default socket when `None`.
    ///
    /// Accepts `unix:///path`, a bare socket path, `tcp://host:port` and
    /// `http://host:port`.
    pub fn connect(socket_url: Option<&str>) -> Result<Self> {
        let (docker, endpoint) = match socket_url {
            None => (
                Docker::connect_with_local_defaults().map_err(unavailable)?,
                "local".to_string(),
            ),
            Some(url) if url.starts_with("tcp://") || url.starts_with("http://") => {
                let addr = url.replacen("tcp://", "http://", 1);
                (
                    Docker::connect_with_http(&addr, DEFAULT_TIMEOUT_SECS, API_DEFAULT_VERSION)
                        .map_err(unavailable)?,
                    addr,
                )
            }
            Some(url) => {
                let path = url.strip_prefix("unix://").unwrap_or(url);
                (
                    Docker::connect_with_socket(path, DEFAULT_TIMEOUT_SECS, API_DEFAULT_VERSION)
                        .map_err(unavailable)?,
                    path.to_string(),
                )
            }
        };

        info!(endpoint = %endpoint, "Podman runtime configured");
        Ok(Self { docker, endpoint })
    }

    /// Endpoint label used in logs.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn pull_if_missing(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        let (from_image, tag) = split_image_tag(image);
        info!(image = %image, "Pulling image");
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(spawn_error)?;
        Ok(())
    }

    async fn remove_if_exists(&self, name_or_id: &str) -> Result<()> {
        match self
            .docker
            .remove_container(
                name_or_id,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(true)
                        .v(true)
                        .build(),
                ),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found_error(&e) => Ok(()),
            Err(e) => Err(operation_error(e)),
        }
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    fn runtime_type(&self) -> &'static str {
        "podman"
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.pull_if_missing(&spec.image).await?;

        // A container left behind by an interrupted start blocks the name.
        self.remove_if_exists(&spec.name).await?;

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            env: (!env.is_empty()).then_some(env),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                network_mode: Some("host".to_string()),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                body,
            )
            .await
            .map_err(spawn_error)?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            let _ = self.remove_if_exists(&created.id).await;
            return Err(spawn_error(e));
        }

        debug!(container_id = %created.id, name = %spec.name, "Container started");
        Ok(ContainerHandle {
            container_id: created.id,
            name: spec.name.clone(),
            started_at: Utc::now(),
        })
    }

    async fn observe(&self, container_id: &str) -> Result<ObservedStatus> {
        let inspect = match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if is_not_found_error(&e) => return Ok(ObservedStatus::NotFound),
            Err(e) => return Err(operation_error(e)),
        };

        let Some(state) = inspect.state else {
            return Ok(ObservedStatus::NotFound);
        };
        if state.running.unwrap_or(false) {
            return Ok(ObservedStatus::Running);
        }

        // Created-but-not-started counts as running until the engine decides.
        let status = state.status.map(|s| s.to_string()).unwrap_or_default();
        if status == "created" || status == "restarting" {
            return Ok(ObservedStatus::Running);
        }
        Ok(ObservedStatus::Exited(state.exit_code.unwrap_or(-1)))
    }

    async fn stop_and_remove(&self, container_id: &str, grace: Duration) -> Result<()> {
        let grace_secs = i32::try_from(grace.as_secs()).unwrap_or(i32::MAX);
        match self
            .docker
            .stop_container(
                container_id,
                Some(StopContainerOptionsBuilder::new().t(grace_secs).build()),
            )
            .await
        {
            Ok(()) => {}
            Err(e) if is_not_found_error(&e) => return Ok(()),
            // 304: already stopped.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => warn!(container_id = %container_id, error = %e, "Stop failed, forcing removal"),
        }
        self.remove_if_exists(container_id).await
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>> {
        let filters = HashMap::from([("label", vec![LABEL_ACTIVATION_ID])]);
        let summaries = self
            .docker
            .list_containers(Some(
                ListContainersOptionsBuilder::new()
                    .all(true)
                    .filters(&filters)
                    .build(),
            ))
            .await
            .map_err(operation_error)?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let container_id = summary.id?;
                let (activation_id, instance_id) = parse_labels(&summary.labels.unwrap_or_default())?;
                let state = summary.state.map(|s| s.to_string()).unwrap_or_default();
                Some(ManagedContainer {
                    container_id,
                    activation_id,
                    instance_id,
                    running: state == "running",
                })
            })
            .collect())
    }

    async fn logs(&self, container_id: &str) -> Result<LogStream> {
        let stream = self
            .docker
            .logs(
                container_id,
                Some(
                    LogsOptionsBuilder::new()
                        .follow(true)
                        .stdout(true)
                        .stderr(true)
                        .build(),
                ),
            )
            .flat_map(|chunk| {
                let lines: Vec<Result<String>> = match chunk {
                    Ok(output) => String::from_utf8_lossy(&output.into_bytes())
                        .lines()
                        .map(|line| Ok(line.to_string()))
                        .collect(),
                    Err(e) => vec![Err(operation_error(e))],
                };
                futures::stream::iter(lines)
            });
        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> Result<()> {
        self.docker.ping().await.map(|_| ()).map_err(operation_error)
    }
}

fn split_image_tag(image: &str) -> (&str, &str) {
    // A colon inside the registry host (registry:5000/img) is not a tag.
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (image, "latest"),
    }
}

fn is_not_found_error(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn unavailable(error: BollardError) -> RuntimeError {
    RuntimeError::RuntimeUnavailable(error.to_string())
}

/// Classify an error from a create/start call: any engine response is a
/// rejection of the spec, anything else is transport.
fn spawn_error(error: BollardError) -> RuntimeError {
    match error {
        BollardError::DockerResponseServerError { .. } => {
            RuntimeError::SpawnRejected(error.to_string())
        }
        other => operation_error(other),
    }
}

fn operation_error(error: BollardError) -> RuntimeError {
    match error {
        BollardError::RequestTimeoutError => RuntimeError::Timeout,
        BollardError::DockerResponseServerError { .. } => RuntimeError::Other(error.to_string()),
        other => RuntimeError::RuntimeUnavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_image_tag() {
        assert_eq!(
            split_image_tag("quay.io/ansible/ansible-rulebook:main"),
            ("quay.io/ansible/ansible-rulebook", "main")
        );
        assert_eq!(split_image_tag("rulebook"), ("rulebook", "latest"));
        assert_eq!(
            split_image_tag("registry:5000/rulebook"),
            ("registry:5000/rulebook", "latest")
        );
    }

    #[test]
    fn test_error_classification() {
        let rejected = spawn_error(BollardError::DockerResponseServerError {
            status_code: 400,
            message: "invalid reference format".into(),
        });
        assert!(matches!(rejected, RuntimeError::SpawnRejected(_)));

        assert!(matches!(
            operation_error(BollardError::RequestTimeoutError),
            RuntimeError::Timeout
        ));
        assert!(is_not_found_error(&BollardError::DockerResponseServerError {
            status_code: 404,
            message: "no such container".into(),
        }));
    }

    #[test]
    fn test_connect_unix_socket_url() {
        // Connecting only builds the client; no request is made.
        let runtime = PodmanRuntime::connect(Some("unix:///run/podman/podman.sock")).unwrap();
        assert_eq!(runtime.endpoint(), "/run/podman/podman.sock");
        assert_eq!(runtime.runtime_type(), "podman");
    }
}
