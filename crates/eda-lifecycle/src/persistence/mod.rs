// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for the activation state store.
//!
//! The store holds activations, their instances, and the per-activation slot
//! flag that backs the global running-set counter.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::activation::{
    Activation, ActivationInstance, ActivationStatus, DesiredState, InstanceClose, Lifecycle,
    NewActivation,
};
use crate::error::{Error, Result};

/// Activation row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ActivationRow {
    pub id: i64,
    pub name: String,
    pub desired_state: String,
    pub image: String,
    pub command: String,
    pub env: String,
    pub restart_policy: String,
    pub restart_seconds_on_complete: Option<i64>,
    pub restart_seconds_on_failure: Option<i64>,
    pub status: String,
    pub restart_count: i32,
    pub last_start_at: Option<DateTime<Utc>>,
    pub last_exit_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub restart_after: Option<DateTime<Utc>>,
    pub slot_held: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ActivationRow> for Activation {
    type Error = Error;

    fn try_from(row: ActivationRow) -> Result<Self> {
        let command: Vec<String> = serde_json::from_str(&row.command)?;
        let env: BTreeMap<String, String> = serde_json::from_str(&row.env)?;
        Ok(Activation {
            id: row.id,
            name: row.name,
            desired_state: row.desired_state.parse()?,
            image: row.image,
            command,
            env,
            restart_policy: row.restart_policy.parse()?,
            restart_seconds_on_complete: row.restart_seconds_on_complete.map(|s| s.max(0) as u64),
            restart_seconds_on_failure: row.restart_seconds_on_failure.map(|s| s.max(0) as u64),
            status: row.status.parse()?,
            restart_count: row.restart_count.max(0) as u32,
            last_start_at: row.last_start_at,
            last_exit_at: row.last_exit_at,
            failure_reason: row.failure_reason,
            restart_after: row.restart_after,
            slot_held: row.slot_held,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Instance row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct InstanceRow {
    pub id: i64,
    pub activation_id: i64,
    pub ordinal: i32,
    pub container_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub end_reason: Option<String>,
    pub failure_reason: Option<String>,
}

impl TryFrom<InstanceRow> for ActivationInstance {
    type Error = Error;

    fn try_from(row: InstanceRow) -> Result<Self> {
        Ok(ActivationInstance {
            id: row.id,
            activation_id: row.activation_id,
            ordinal: row.ordinal,
            container_id: row.container_id,
            started_at: row.started_at,
            ended_at: row.ended_at,
            exit_code: row.exit_code,
            end_reason: row.end_reason.map(|r| r.parse()).transpose()?,
            failure_reason: row.failure_reason,
        })
    }
}

pub(crate) const ACTIVATION_COLUMNS: &str = "id, name, desired_state, image, command, env, \
    restart_policy, restart_seconds_on_complete, restart_seconds_on_failure, status, \
    restart_count, last_start_at, last_exit_at, failure_reason, restart_after, slot_held, \
    created_at, updated_at";

pub(crate) const INSTANCE_COLUMNS: &str = "id, activation_id, ordinal, container_id, \
    started_at, ended_at, exit_code, end_reason, failure_reason";

/// Serialized command and env columns of a new activation.
pub(crate) fn encode_spec(new: &NewActivation) -> Result<(String, String)> {
    Ok((
        serde_json::to_string(&new.command)?,
        serde_json::to_string(&new.env)?,
    ))
}

/// Map a unique violation on the open-instance index.
pub(crate) fn map_open_instance_error(err: sqlx::Error, activation_id: i64) -> Error {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::InstanceAlreadyOpen { activation_id }
        }
        _ => err.into(),
    }
}

/// Durable storage for activations and their instances.
///
/// All status changes go through [`Persistence::update_lifecycle`], a
/// compare-and-set on the current status, so concurrent writers can never
/// both win the same transition.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Insert a new activation in `Stopped`.
    async fn create_activation(&self, new: &NewActivation) -> Result<Activation>;

    /// Fetch an activation.
    async fn get_activation(&self, id: i64) -> Result<Option<Activation>>;

    /// All activations, ascending by id.
    async fn list_activations(&self) -> Result<Vec<Activation>>;

    /// Set the user's desired state.
    async fn set_desired_state(&self, id: i64, desired: DesiredState) -> Result<bool>;

    /// Write lifecycle fields if the activation is still in `expected`.
    ///
    /// Returns false when another writer changed the status first.
    async fn update_lifecycle(
        &self,
        id: i64,
        expected: ActivationStatus,
        lifecycle: &Lifecycle,
    ) -> Result<bool>;

    /// Delete an activation and its instances.
    async fn delete_activation(&self, id: i64) -> Result<bool>;

    /// Atomically take a runtime slot for `id` if fewer than `cap` are held.
    ///
    /// Returns false when the cap is reached or the activation already
    /// holds a slot.
    async fn try_acquire_slot(&self, id: i64, cap: u32) -> Result<bool>;

    /// Give back the slot held by `id`. Releasing twice is a no-op.
    async fn release_slot(&self, id: i64) -> Result<bool>;

    /// Number of slots currently held.
    async fn count_slots(&self) -> Result<u32>;

    /// Reset slot flags so exactly `running` hold slots.
    async fn rebuild_slots(&self, running: &[i64]) -> Result<u32>;

    /// Open the next instance of an activation.
    ///
    /// Fails with [`Error::InstanceAlreadyOpen`] if one is still open.
    async fn open_instance(
        &self,
        activation_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<ActivationInstance>;

    /// Record the container backing an instance.
    async fn set_instance_container(&self, instance_id: i64, container_id: &str) -> Result<()>;

    /// Close an open instance. Returns false if it was already closed.
    async fn close_instance(&self, instance_id: i64, close: &InstanceClose) -> Result<bool>;

    /// The open instance of an activation, if any.
    async fn get_open_instance(&self, activation_id: i64) -> Result<Option<ActivationInstance>>;

    /// Instances of an activation, newest first.
    async fn list_instances(&self, activation_id: i64) -> Result<Vec<ActivationInstance>>;

    /// Delete closed instances beyond the newest `keep`.
    async fn prune_instances(&self, activation_id: i64, keep: u32) -> Result<u64>;

    /// Check database connectivity.
    async fn health_check(&self) -> Result<()>;
}
