// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the activation lifecycle manager.

use thiserror::Error;

use crate::activation::ActivationStatus;

/// Lifecycle errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// The state store could not be reached.
    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Container runtime operation failed.
    #[error("Runtime error: {0}")]
    Runtime(#[from] crate::container::RuntimeError),

    /// A lifecycle transition outside the state machine was requested.
    #[error("Activation {activation_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        /// Activation the transition was attempted on.
        activation_id: i64,
        /// Status the activation was in.
        from: ActivationStatus,
        /// Requested status.
        to: ActivationStatus,
    },

    /// Activation was not found.
    #[error("Activation not found: {0}")]
    ActivationNotFound(i64),

    /// An activation already has an unclosed instance.
    #[error("Activation {activation_id} already has an open instance")]
    InstanceAlreadyOpen {
        /// Activation that owns the open instance.
        activation_id: i64,
    },

    /// A job was redelivered after its lease expired and the work was
    /// already done.
    #[error("Job {job_id} for activation {activation_id} redelivered after lease expiry")]
    LeaseExpiredDuplicate {
        /// Redelivered job.
        job_id: i64,
        /// Activation the job targets.
        activation_id: i64,
    },

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Log relay failed.
    #[error("Log relay error: {0}")]
    LogRelay(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Error::PersistenceUnavailable(err.to_string()),
            other => Error::Database(other),
        }
    }
}

impl Error {
    /// Whether the owning loop should retry the operation later.
    ///
    /// Transient errors are infrastructure outages; they are retried and
    /// never surfaced past the worker/scheduler boundary.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::PersistenceUnavailable(_) | Error::Database(_) => true,
            Error::Runtime(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type using the lifecycle Error.
pub type Result<T> = std::result::Result<T, Error>;
