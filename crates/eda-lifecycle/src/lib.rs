// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! EDA Lifecycle - Activation Lifecycle Management
//!
//! This crate schedules, launches, supervises, restarts and retires
//! long-running activations (rulebook evaluation processes) inside
//! containers, under a global concurrency cap and a restart policy driven by
//! how each run ended.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  ActivationService (API calls)                   │
//! └──────────────────────────────────────────────────────────────────┘
//!            │ desired state                      │ Stop / Restart / Delete
//!            ▼                                    ▼
//! ┌─────────────────────┐   Start / Stop   ┌──────────────────────────┐
//! │      Scheduler      │ ───────────────▶ │        Job queue         │
//! │  (reconciliation)   │   Monitor        │  default  │  activation  │
//! └─────────────────────┘                  └──────────────────────────┘
//!            │ slots                               │ lease
//!            ▼                                     ▼
//! ┌─────────────────────┐               ┌──────────────────────────┐
//! │     State store     │ ◀──────────── │     Worker pools         │
//! │ activations, slots, │   lifecycle   │ Maintenance │ Activation │
//! │ instances, jobs     │               └──────────────────────────┘
//! └─────────────────────┘                          │ create / observe / stop
//!                                                  ▼
//!                                       ┌──────────────────────────┐
//!                                       │ Container engine (podman)│
//!                                       └──────────────────────────┘
//! ```
//!
//! # Activation Status State Machine
//!
//! ```text
//!              ┌─────────┐  admit + start   ┌─────────┐
//!     ┌───────▶│ STOPPED │ ───────────────▶ │ RUNNING │
//!     │        └─────────┘                  └────┬────┘
//!     │  stop       ▲                  exit 0    │   exit != 0 / lost
//!     │             │ stop          ┌────────────┴────────────┐
//!     │             │               ▼                         ▼
//!     │        ┌──────────┐    ┌───────────┐  restart   ┌──────────┐
//!     │        │ ERRORED  │◀───│  FAILED   │◀────────── │COMPLETED │
//!     │        └──────────┘cap └───────────┘  fails     └──────────┘
//!     │                             │ backoff                 │ backoff
//!     └─────────────────────────────┴──── back to RUNNING ────┘
//! ```
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `EDA_DATABASE_URL` | - | `postgres://...` or `sqlite:...` |
//! | `EDA_MAX_RUNNING_ACTIVATIONS` | `12` | Global concurrency cap |
//! | `EDA_ACTIVATION_RESTART_SECONDS_ON_COMPLETE` | `0` | Backoff after a clean exit |
//! | `EDA_ACTIVATION_RESTART_SECONDS_ON_FAILURE` | `60` | Backoff after a failure |
//! | `EDA_ACTIVATION_MAX_RESTARTS_ON_FAILURE` | `5` | Failures before `errored` (`unlimited` disables) |
//! | `EDA_PODMAN_SOCKET_URL` | local socket | Container engine endpoint |
//! | `EDA_WEBSOCKET_BASE_URL` | - | Log relay; unset logs container output locally |
//!
//! See [`config::Config`] for the full list.
//!
//! # Modules
//!
//! - [`activation`]: Activation, instance and status types
//! - [`admission`]: Global running-set counter
//! - [`config`]: Configuration from environment variables
//! - [`container`]: Container engine adapter (podman, mock)
//! - [`error`]: Error types
//! - [`log_relay`]: Forwarding container output
//! - [`persistence`]: State store (PostgreSQL, SQLite)
//! - [`policy`]: Restart policy
//! - [`queue`]: Durable job queue with leases
//! - [`scheduler`]: Reconciliation loop
//! - [`service`]: Control operations
//! - [`worker`]: Job handlers
//! - [`worker_pool`]: Lease loop running handlers
//! - [`runtime`]: Embeddable runtime

#![deny(missing_docs)]

/// Activation, instance and status types.
pub mod activation;

/// Global running-set counter.
pub mod admission;

/// Configuration loaded from environment variables.
pub mod config;

/// Container engine adapter.
pub mod container;

/// Error types.
pub mod error;

/// Container log forwarding.
pub mod log_relay;

/// Database migrations.
pub mod migrations;

/// State store for activations, slots and instances.
pub mod persistence;

/// Restart policy.
pub mod policy;

/// Durable job queue.
pub mod queue;

/// Embeddable runtime.
pub mod runtime;

/// Reconciliation loop.
pub mod scheduler;

/// Control operations on activations.
pub mod service;

/// Job handlers.
pub mod worker;

/// Worker pool loop.
pub mod worker_pool;

pub use activation::{Activation, ActivationInstance, ActivationStatus, DesiredState, NewActivation};
pub use config::Config;
pub use container::{ContainerRuntime, MockRuntime, PodmanRuntime};
pub use error::Error;
pub use persistence::{Persistence, PostgresPersistence, SqlitePersistence};
pub use queue::{JobQueue, PostgresJobQueue, SqliteJobQueue};
pub use runtime::{LifecycleRuntime, Roles};
pub use service::ActivationService;
