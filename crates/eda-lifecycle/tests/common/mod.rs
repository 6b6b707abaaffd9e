// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for eda-lifecycle integration tests.
//!
//! Provides a TestContext wiring an in-memory SQLite store, the mock
//! container runtime, the scheduler and both worker pools, driven step by
//! step instead of through their loops.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use eda_lifecycle::activation::{Activation, ActivationInstance, NewActivation};
use eda_lifecycle::admission::RunningSet;
use eda_lifecycle::config::Config;
use eda_lifecycle::container::MockRuntime;
use eda_lifecycle::log_relay::TracingLogSink;
use eda_lifecycle::persistence::{Persistence, SqlitePersistence};
use eda_lifecycle::queue::{JobQueue, PoolName, SqliteJobQueue};
use eda_lifecycle::scheduler::{Scheduler, SchedulerConfig};
use eda_lifecycle::service::ActivationService;
use eda_lifecycle::worker::{ActivationWorker, MaintenanceWorker, WorkerSettings};
use eda_lifecycle::worker_pool::{Processed, WorkerPool, WorkerPoolConfig};

pub const IMAGE: &str = "quay.io/ansible/ansible-rulebook:main";

/// Configuration for tests: supervision hands off after a single
/// observation so every job finishes immediately.
pub fn test_config(overrides: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = HashMap::from([
        ("EDA_DATABASE_URL".to_string(), "sqlite::memory:".to_string()),
        ("EDA_ACTIVATION_MONITOR_WINDOW_SECONDS".to_string(), "0".to_string()),
        ("EDA_CONTAINER_POLL_INTERVAL_SECONDS".to_string(), "1".to_string()),
        ("EDA_CONTAINER_START_TIMEOUT_SECONDS".to_string(), "5".to_string()),
        ("EDA_CONTAINER_STOP_GRACE_SECONDS".to_string(), "1".to_string()),
        ("EDA_JOB_LEASE_SECONDS".to_string(), "30".to_string()),
    ]);
    for (key, value) in overrides {
        vars.insert(key.to_string(), value.to_string());
    }
    Config::from_lookup(|key| vars.get(key).cloned()).expect("valid test config")
}

pub fn no_backoff(config: &Config, concurrency: usize) -> WorkerPoolConfig {
    WorkerPoolConfig {
        idle_poll: Duration::from_millis(10),
        retry_backoff: Duration::ZERO,
        ..WorkerPoolConfig::from_config(config, concurrency)
    }
}

/// Everything a lifecycle test needs, sharing one database.
pub struct TestContext {
    pub config: Config,
    pub persistence: Arc<SqlitePersistence>,
    pub queue: Arc<SqliteJobQueue>,
    pub runtime: Arc<MockRuntime>,
    pub running_set: RunningSet,
    pub scheduler: Scheduler,
    pub worker: Arc<ActivationWorker>,
    pub activation_pool: WorkerPool<ActivationWorker>,
    pub default_pool: WorkerPool<MaintenanceWorker>,
    pub service: ActivationService,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(test_config(&[])).await
    }

    pub async fn with_overrides(overrides: &[(&str, &str)]) -> Self {
        Self::with_config(test_config(overrides)).await
    }

    pub async fn with_config(config: Config) -> Self {
        let persistence = Arc::new(
            SqlitePersistence::connect(&config.database_url)
                .await
                .expect("Failed to create in-memory SQLite persistence"),
        );
        let queue = Arc::new(SqliteJobQueue::new(persistence.pool().clone()));
        let runtime = Arc::new(MockRuntime::new());

        let store: Arc<dyn Persistence> = persistence.clone();
        let jobs: Arc<dyn JobQueue> = queue.clone();

        let running_set = RunningSet::new(store.clone(), config.max_running_activations);
        let scheduler = Scheduler::new(
            store.clone(),
            jobs.clone(),
            running_set.clone(),
            SchedulerConfig {
                interval: config.scheduler_interval,
            },
        );
        let worker = Arc::new(ActivationWorker::new(
            store.clone(),
            jobs.clone(),
            runtime.clone(),
            Arc::new(TracingLogSink),
            running_set.clone(),
            WorkerSettings::from(&config),
        ));
        let activation_pool = WorkerPool::new(
            worker.clone(),
            jobs.clone(),
            no_backoff(&config, config.activation_worker_concurrency),
        );
        let default_pool = WorkerPool::new(
            Arc::new(MaintenanceWorker::new(store.clone(), config.history_limit)),
            jobs.clone(),
            no_backoff(&config, config.default_worker_concurrency),
        );
        let service = ActivationService::new(store, jobs);

        Self {
            config,
            persistence,
            queue,
            runtime,
            running_set,
            scheduler,
            worker,
            activation_pool,
            default_pool,
            service,
        }
    }

    pub async fn create(&self, name: &str) -> Activation {
        self.service
            .create(&NewActivation::new(name, IMAGE))
            .await
            .unwrap()
    }

    pub async fn create_with(&self, new: NewActivation) -> Activation {
        self.service.create(&new).await.unwrap()
    }

    pub async fn activation(&self, id: i64) -> Activation {
        self.service.get(id).await.unwrap()
    }

    pub async fn instances(&self, id: i64) -> Vec<ActivationInstance> {
        self.service.instances(id).await.unwrap()
    }

    /// Run each job currently queued on the activation pool once. Jobs
    /// enqueued while the round runs wait for the next round.
    pub async fn pump(&self) -> Vec<Processed> {
        let queued = self.queue.depth(PoolName::Activation).await.unwrap();
        let mut processed = Vec::new();
        for _ in 0..queued {
            match self.activation_pool.process_next().await.unwrap() {
                Some(p) => processed.push(p),
                None => break,
            }
        }
        processed
    }

    /// Run every queued maintenance job.
    pub async fn pump_default(&self) -> usize {
        let mut n = 0;
        while self.default_pool.process_next().await.unwrap().is_some() {
            n += 1;
        }
        n
    }

    /// One scheduler tick followed by one worker round.
    pub async fn cycle(&self) {
        self.scheduler.tick().await.unwrap();
        self.pump().await;
    }

    pub async fn held(&self) -> u32 {
        self.running_set.held().await.unwrap()
    }
}
