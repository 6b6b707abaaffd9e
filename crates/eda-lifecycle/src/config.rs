// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the activation lifecycle manager.

use std::time::Duration;

const DEFAULT_MAX_RUNNING_ACTIVATIONS: u32 = 12;
const DEFAULT_RESTART_SECONDS_ON_COMPLETE: u64 = 0;
const DEFAULT_RESTART_SECONDS_ON_FAILURE: u64 = 60;
const DEFAULT_MAX_RESTARTS_ON_FAILURE: u32 = 5;

/// Lifecycle configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// State store URL (`postgres://...` or `sqlite:...`)
    pub database_url: String,
    /// Global concurrency cap on running activations
    pub max_running_activations: u32,
    /// Backoff before restarting a cleanly completed activation
    pub restart_seconds_on_complete: u64,
    /// Backoff before restarting a failed activation
    pub restart_seconds_on_failure: u64,
    /// Consecutive failures tolerated before an activation is errored.
    /// `None` retries forever.
    pub max_restarts_on_failure: Option<u32>,
    /// Container engine control endpoint; `None` uses the local default socket
    pub podman_socket_url: Option<String>,
    /// Log relay endpoint; `None` logs container output through tracing
    pub websocket_base_url: Option<String>,
    /// Scheduler reconciliation interval
    pub scheduler_interval: Duration,
    /// Concurrent handlers in the default pool
    pub default_worker_concurrency: usize,
    /// Concurrent handlers in the activation pool
    pub activation_worker_concurrency: usize,
    /// Job visibility timeout
    pub job_lease: Duration,
    /// Deliveries before a job is dead-lettered
    pub job_max_retries: u32,
    /// How long a worker supervises a container before handing off
    pub monitor_window: Duration,
    /// Container observation cadence
    pub container_poll_interval: Duration,
    /// Bound on container creation + start
    pub container_start_timeout: Duration,
    /// Grace period for stopping a container
    pub container_stop_grace: Duration,
    /// Closed instances kept per activation
    pub history_limit: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("EDA_DATABASE_URL")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingEnvVar("EDA_DATABASE_URL"))?;

        let max_running_activations = parse_or(
            &lookup,
            "EDA_MAX_RUNNING_ACTIVATIONS",
            DEFAULT_MAX_RUNNING_ACTIVATIONS,
        )?;
        if max_running_activations == 0 {
            return Err(ConfigError::Invalid {
                key: "EDA_MAX_RUNNING_ACTIVATIONS",
                reason: "must be at least 1".to_string(),
            });
        }

        let max_restarts_on_failure = match lookup("EDA_ACTIVATION_MAX_RESTARTS_ON_FAILURE") {
            None => Some(DEFAULT_MAX_RESTARTS_ON_FAILURE),
            Some(v) if v.eq_ignore_ascii_case("unlimited") => None,
            Some(v) => Some(v.parse().map_err(|_| ConfigError::InvalidNumber {
                key: "EDA_ACTIVATION_MAX_RESTARTS_ON_FAILURE",
                value: v.clone(),
            })?),
        };

        let config = Self {
            database_url,
            max_running_activations,
            restart_seconds_on_complete: parse_or(
                &lookup,
                "EDA_ACTIVATION_RESTART_SECONDS_ON_COMPLETE",
                DEFAULT_RESTART_SECONDS_ON_COMPLETE,
            )?,
            restart_seconds_on_failure: parse_or(
                &lookup,
                "EDA_ACTIVATION_RESTART_SECONDS_ON_FAILURE",
                DEFAULT_RESTART_SECONDS_ON_FAILURE,
            )?,
            max_restarts_on_failure,
            podman_socket_url: lookup("EDA_PODMAN_SOCKET_URL").filter(|v| !v.is_empty()),
            websocket_base_url: lookup("EDA_WEBSOCKET_BASE_URL").filter(|v| !v.is_empty()),
            scheduler_interval: Duration::from_secs(parse_or(
                &lookup,
                "EDA_SCHEDULER_INTERVAL_SECONDS",
                5,
            )?),
            default_worker_concurrency: parse_or(&lookup, "EDA_DEFAULT_WORKER_CONCURRENCY", 2)?,
            activation_worker_concurrency: parse_or(
                &lookup,
                "EDA_ACTIVATION_WORKER_CONCURRENCY",
                12,
            )?,
            job_lease: Duration::from_secs(parse_or(&lookup, "EDA_JOB_LEASE_SECONDS", 300)?),
            job_max_retries: parse_or(&lookup, "EDA_JOB_MAX_RETRIES", 5)?,
            monitor_window: Duration::from_secs(parse_or(
                &lookup,
                "EDA_ACTIVATION_MONITOR_WINDOW_SECONDS",
                60,
            )?),
            container_poll_interval: Duration::from_secs(parse_or(
                &lookup,
                "EDA_CONTAINER_POLL_INTERVAL_SECONDS",
                2,
            )?),
            container_start_timeout: Duration::from_secs(parse_or(
                &lookup,
                "EDA_CONTAINER_START_TIMEOUT_SECONDS",
                60,
            )?),
            container_stop_grace: Duration::from_secs(parse_or(
                &lookup,
                "EDA_CONTAINER_STOP_GRACE_SECONDS",
                10,
            )?),
            history_limit: parse_or(&lookup, "EDA_ACTIVATION_HISTORY_LIMIT", 20)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // A supervising worker must finish its window before its lease lapses.
        if self.job_lease <= self.monitor_window + self.container_start_timeout {
            return Err(ConfigError::Invalid {
                key: "EDA_JOB_LEASE_SECONDS",
                reason: format!(
                    "lease ({}s) must exceed monitor window + start timeout ({}s)",
                    self.job_lease.as_secs(),
                    (self.monitor_window + self.container_start_timeout).as_secs()
                ),
            });
        }
        if self.default_worker_concurrency == 0 || self.activation_worker_concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "EDA_*_WORKER_CONCURRENCY",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.container_poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "EDA_CONTAINER_POLL_INTERVAL_SECONDS",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A numeric variable did not parse.
    #[error("Invalid value for {key}: '{value}'")]
    InvalidNumber {
        /// Variable name.
        key: &'static str,
        /// Raw value.
        value: String,
    },
    /// A value parsed but is out of range.
    #[error("Invalid {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
