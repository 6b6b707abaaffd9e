// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runtime for testing.
//!
//! Simulates containers in memory. Containers keep running until a test
//! exits them, so every lifecycle edge can be driven deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::*;

/// Mock container state.
#[derive(Debug, Clone)]
struct MockContainer {
    spec: ContainerSpec,
    status: ObservedStatus,
}

/// Mock runtime for testing.
pub struct MockRuntime {
    containers: Arc<Mutex<HashMap<String, MockContainer>>>,
    next_id: AtomicU64,
    created: AtomicU64,
    /// If true, every operation fails with `RuntimeUnavailable`.
    unavailable: AtomicBool,
    /// If true, `create_and_start` fails with `SpawnRejected`.
    reject_spawns: AtomicBool,
    /// If true, `observe` fails with a non-transient `Other`.
    fail_observe: AtomicBool,
    /// Lines returned by `logs`.
    log_lines: Vec<String>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self {
            containers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            reject_spawns: AtomicBool::new(false),
            fail_observe: AtomicBool::new(false),
            log_lines: Vec::new(),
        }
    }

    /// Create a mock runtime whose containers print `lines`.
    pub fn with_log_lines(lines: Vec<String>) -> Self {
        Self {
            log_lines: lines,
            ..Self::new()
        }
    }

    /// Toggle control-socket availability.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Toggle spec rejection.
    pub fn set_reject_spawns(&self, reject: bool) {
        self.reject_spawns.store(reject, Ordering::SeqCst);
    }

    /// Toggle engine errors on status polls.
    pub fn set_fail_observe(&self, fail: bool) {
        self.fail_observe.store(fail, Ordering::SeqCst);
    }

    /// Number of containers ever created.
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of containers currently running.
    pub async fn running_count(&self) -> usize {
        let containers = self.containers.lock().await;
        containers
            .values()
            .filter(|c| c.status == ObservedStatus::Running)
            .count()
    }

    /// Running container ids for an activation.
    pub async fn running_for(&self, activation_id: i64) -> Vec<String> {
        let containers = self.containers.lock().await;
        containers
            .iter()
            .filter(|(_, c)| {
                c.status == ObservedStatus::Running
                    && parse_labels(&c.spec.labels).map(|(a, _)| a) == Some(activation_id)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Make a container exit with `code`.
    pub async fn exit_container(&self, container_id: &str, code: i64) {
        let mut containers = self.containers.lock().await;
        if let Some(container) = containers.get_mut(container_id) {
            container.status = ObservedStatus::Exited(code);
        }
    }

    /// Make every running container of an activation exit with `code`.
    pub async fn exit_activation(&self, activation_id: i64, code: i64) {
        for id in self.running_for(activation_id).await {
            self.exit_container(&id, code).await;
        }
    }

    /// Remove a container behind the manager's back.
    pub async fn vanish(&self, container_id: &str) {
        self.containers.lock().await.remove(container_id);
    }

    /// Start a labelled container directly, as if left over from a previous run.
    pub async fn adopt_running(&self, spec: ContainerSpec) -> String {
        let id = format!("mock_{:06}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().await.insert(
            id.clone(),
            MockContainer {
                spec,
                status: ObservedStatus::Running,
            },
        );
        id
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RuntimeError::RuntimeUnavailable(
                "mock control socket down".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.check_available()?;
        if self.reject_spawns.load(Ordering::SeqCst) {
            return Err(RuntimeError::SpawnRejected(format!(
                "image '{}' not found",
                spec.image
            )));
        }

        let mut containers = self.containers.lock().await;
        // Same-name containers are replaced, like the podman adapter does.
        containers.retain(|_, c| c.spec.name != spec.name);

        let id = format!("mock_{:06}", self.next_id.fetch_add(1, Ordering::SeqCst));
        containers.insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                status: ObservedStatus::Running,
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);

        Ok(ContainerHandle {
            container_id: id,
            name: spec.name.clone(),
            started_at: Utc::now(),
        })
    }

    async fn observe(&self, container_id: &str) -> Result<ObservedStatus> {
        self.check_available()?;
        if self.fail_observe.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other("inspect returned 500".to_string()));
        }
        let containers = self.containers.lock().await;
        Ok(containers
            .get(container_id)
            .map(|c| c.status)
            .unwrap_or(ObservedStatus::NotFound))
    }

    async fn stop_and_remove(&self, container_id: &str, _grace: Duration) -> Result<()> {
        self.check_available()?;
        self.containers.lock().await.remove(container_id);
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>> {
        self.check_available()?;
        let containers = self.containers.lock().await;
        Ok(containers
            .iter()
            .filter_map(|(id, c)| {
                let (activation_id, instance_id) = parse_labels(&c.spec.labels)?;
                Some(ManagedContainer {
                    container_id: id.clone(),
                    activation_id,
                    instance_id,
                    running: c.status == ObservedStatus::Running,
                })
            })
            .collect())
    }

    async fn logs(&self, _container_id: &str) -> Result<LogStream> {
        self.check_available()?;
        let lines: Vec<Result<String>> = self.log_lines.iter().cloned().map(Ok).collect();
        Ok(Box::pin(futures::stream::iter(lines)))
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}
