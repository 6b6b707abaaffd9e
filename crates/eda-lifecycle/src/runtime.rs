// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the lifecycle manager.
//!
//! [`LifecycleRuntime`] wires the scheduler and the worker pools onto an
//! existing tokio application. Which loops run in this process is chosen by
//! [`Roles`], so a deployment can split the scheduler and each worker class
//! into separate processes sharing one state store.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use eda_lifecycle::{Config, LifecycleRuntime, PodmanRuntime, SqlitePersistence, SqliteJobQueue};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let pool = eda_lifecycle::persistence::sqlite::connect_pool(&config.database_url).await?;
//!
//!     let runtime = LifecycleRuntime::builder()
//!         .persistence(Arc::new(SqlitePersistence::new(pool.clone())))
//!         .queue(Arc::new(SqliteJobQueue::new(pool)))
//!         .container_runtime(Arc::new(PodmanRuntime::connect(None)?))
//!         .config(config)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::admission::RunningSet;
use crate::config::Config;
use crate::container::ContainerRuntime;
use crate::log_relay::{LogSink, TracingLogSink};
use crate::persistence::Persistence;
use crate::queue::{JobQueue, PoolName};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::service::ActivationService;
use crate::worker::{ActivationWorker, MaintenanceWorker, WorkerSettings};
use crate::worker_pool::{WorkerPool, WorkerPoolConfig};

/// Loops run by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roles {
    /// Run the scheduler (and startup recovery).
    pub scheduler: bool,
    /// Run the default worker pool.
    pub default_worker: bool,
    /// Run the activation worker pool.
    pub activation_worker: bool,
}

impl Roles {
    /// Scheduler and both pools.
    pub fn all() -> Self {
        Self {
            scheduler: true,
            default_worker: true,
            activation_worker: true,
        }
    }

    /// Only the scheduler.
    pub fn scheduler() -> Self {
        Self {
            scheduler: true,
            default_worker: false,
            activation_worker: false,
        }
    }

    /// Only the worker pool of `pool`.
    pub fn worker(pool: PoolName) -> Self {
        Self {
            scheduler: false,
            default_worker: pool == PoolName::Default,
            activation_worker: pool == PoolName::Activation,
        }
    }
}

impl Default for Roles {
    fn default() -> Self {
        Self::all()
    }
}

/// Builder for creating a [`LifecycleRuntime`].
#[derive(Default)]
pub struct LifecycleRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    queue: Option<Arc<dyn JobQueue>>,
    container_runtime: Option<Arc<dyn ContainerRuntime>>,
    log_sink: Option<Arc<dyn LogSink>>,
    config: Option<Config>,
    roles: Roles,
}

impl LifecycleRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the state store (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the job queue (required).
    pub fn queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the container engine adapter (required).
    pub fn container_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.container_runtime = Some(runtime);
        self
    }

    /// Set where container output goes.
    ///
    /// Default: [`TracingLogSink`]
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Set the lifecycle configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Select the loops to run.
    ///
    /// Default: [`Roles::all`]
    pub fn roles(mut self, roles: Roles) -> Self {
        self.roles = roles;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or the configuration
    /// is inconsistent.
    pub fn build(self) -> Result<LifecycleRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue is required"))?;
        let container_runtime = self
            .container_runtime
            .ok_or_else(|| anyhow::anyhow!("container_runtime is required"))?;
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        config.validate()?;

        Ok(LifecycleRuntimeConfig {
            persistence,
            queue,
            container_runtime,
            log_sink: self.log_sink.unwrap_or_else(|| Arc::new(TracingLogSink)),
            config,
            roles: self.roles,
        })
    }
}

/// Configuration for a [`LifecycleRuntime`].
pub struct LifecycleRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    queue: Arc<dyn JobQueue>,
    container_runtime: Arc<dyn ContainerRuntime>,
    log_sink: Arc<dyn LogSink>,
    config: Config,
    roles: Roles,
}

impl LifecycleRuntimeConfig {
    /// Recover from the previous run, then spawn the selected loops.
    pub async fn start(self) -> Result<LifecycleRuntime> {
        let running_set = RunningSet::new(
            self.persistence.clone(),
            self.config.max_running_activations,
        );
        let mut loops = Vec::new();

        if self.roles.scheduler {
            let scheduler = Scheduler::new(
                self.persistence.clone(),
                self.queue.clone(),
                running_set.clone(),
                SchedulerConfig {
                    interval: self.config.scheduler_interval,
                },
            )
            .with_startup_recovery(
                self.container_runtime.clone(),
                self.config.container_stop_grace,
            );

            if let Err(e) = scheduler.recover_from_engine().await {
                warn!(error = %e, "Startup recovery deferred, admission paused");
            }

            let shutdown = scheduler.shutdown_handle();
            let handle = tokio::spawn(async move {
                scheduler.run().await;
            });
            loops.push(Loop {
                name: "scheduler",
                handle,
                shutdown,
            });
        }

        if self.roles.activation_worker {
            let worker = ActivationWorker::new(
                self.persistence.clone(),
                self.queue.clone(),
                self.container_runtime.clone(),
                self.log_sink.clone(),
                running_set.clone(),
                WorkerSettings::from(&self.config),
            );
            let pool = WorkerPool::new(
                Arc::new(worker),
                self.queue.clone(),
                WorkerPoolConfig::from_config(
                    &self.config,
                    self.config.activation_worker_concurrency,
                ),
            );
            let shutdown = pool.shutdown_handle();
            let handle = tokio::spawn(async move {
                pool.run().await;
            });
            loops.push(Loop {
                name: "activation worker pool",
                handle,
                shutdown,
            });
        }

        if self.roles.default_worker {
            let worker =
                MaintenanceWorker::new(self.persistence.clone(), self.config.history_limit);
            let pool = WorkerPool::new(
                Arc::new(worker),
                self.queue.clone(),
                WorkerPoolConfig::from_config(&self.config, self.config.default_worker_concurrency),
            );
            let shutdown = pool.shutdown_handle();
            let handle = tokio::spawn(async move {
                pool.run().await;
            });
            loops.push(Loop {
                name: "default worker pool",
                handle,
                shutdown,
            });
        }

        info!(
            runtime = self.container_runtime.runtime_type(),
            scheduler = self.roles.scheduler,
            default_worker = self.roles.default_worker,
            activation_worker = self.roles.activation_worker,
            cap = self.config.max_running_activations,
            "LifecycleRuntime started"
        );

        Ok(LifecycleRuntime {
            loops,
            service: ActivationService::new(self.persistence, self.queue),
        })
    }
}

struct Loop {
    name: &'static str,
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

/// A running lifecycle manager embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct LifecycleRuntime {
    loops: Vec<Loop>,
    service: ActivationService,
}

impl LifecycleRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> LifecycleRuntimeBuilder {
        LifecycleRuntimeBuilder::new()
    }

    /// Control operations backed by this runtime's state store.
    pub fn service(&self) -> &ActivationService {
        &self.service
    }

    /// Check if every loop is still running.
    pub fn is_running(&self) -> bool {
        self.loops.iter().all(|l| !l.handle.is_finished())
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals every loop, then waits for the worker pools to drain their
    /// in-flight jobs.
    pub async fn shutdown(self) -> Result<()> {
        info!("LifecycleRuntime shutting down...");

        for l in &self.loops {
            l.shutdown.notify_one();
        }

        let mut panicked = 0;
        for l in self.loops {
            if let Err(e) = l.handle.await {
                error!("{} task panicked: {}", l.name, e);
                panicked += 1;
            }
        }

        if panicked > 0 {
            return Err(anyhow::anyhow!("{panicked} lifecycle task(s) panicked"));
        }
        info!("LifecycleRuntime shutdown complete");
        Ok(())
    }
}
