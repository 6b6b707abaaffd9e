// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::activation::{
    Activation, ActivationInstance, ActivationStatus, DesiredState, InstanceClose, Lifecycle,
    NewActivation,
};
use crate::error::Result;

use super::{
    ACTIVATION_COLUMNS, ActivationRow, INSTANCE_COLUMNS, InstanceRow, Persistence, encode_spec,
    map_open_instance_error,
};

/// Advisory lock key serializing slot acquisition across processes.
const SLOT_LOCK_KEY: i64 = 0x4544_415f_534c_4f54;

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, shared with the job queue.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn create_activation(&self, new: &NewActivation) -> Result<Activation> {
        let (command, env) = encode_spec(new)?;
        let row = sqlx::query_as::<_, ActivationRow>(&format!(
            r#"
            INSERT INTO activations (name, desired_state, image, command, env, restart_policy,
                                     restart_seconds_on_complete, restart_seconds_on_failure)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {ACTIVATION_COLUMNS}
            "#
        ))
        .bind(&new.name)
        .bind(new.desired_state().as_str())
        .bind(&new.image)
        .bind(command)
        .bind(env)
        .bind(new.restart_policy.as_str())
        .bind(new.restart_seconds_on_complete.map(|s| s as i64))
        .bind(new.restart_seconds_on_failure.map(|s| s as i64))
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_activation(&self, id: i64) -> Result<Option<Activation>> {
        let row = sqlx::query_as::<_, ActivationRow>(&format!(
            "SELECT {ACTIVATION_COLUMNS} FROM activations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Activation::try_from).transpose()
    }

    async fn list_activations(&self) -> Result<Vec<Activation>> {
        let rows = sqlx::query_as::<_, ActivationRow>(&format!(
            "SELECT {ACTIVATION_COLUMNS} FROM activations ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Activation::try_from).collect()
    }

    async fn set_desired_state(&self, id: i64, desired: DesiredState) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE activations SET desired_state = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(desired.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_lifecycle(
        &self,
        id: i64,
        expected: ActivationStatus,
        lifecycle: &Lifecycle,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE activations
            SET status = $1, restart_count = $2, last_start_at = $3, last_exit_at = $4,
                failure_reason = $5, restart_after = $6, updated_at = NOW()
            WHERE id = $7 AND status = $8
            "#,
        )
        .bind(lifecycle.status.as_str())
        .bind(lifecycle.restart_count as i32)
        .bind(lifecycle.last_start_at)
        .bind(lifecycle.last_exit_at)
        .bind(&lifecycle.failure_reason)
        .bind(lifecycle.restart_after)
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_activation(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM activations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn try_acquire_slot(&self, id: i64, cap: u32) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SLOT_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            r#"
            UPDATE activations
            SET slot_held = TRUE, updated_at = NOW()
            WHERE id = $1 AND NOT slot_held
              AND (SELECT COUNT(*) FROM activations WHERE slot_held) < $2
            "#,
        )
        .bind(id)
        .bind(cap as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_slot(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE activations SET slot_held = FALSE, updated_at = NOW() WHERE id = $1 AND slot_held",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_slots(&self) -> Result<u32> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM activations WHERE slot_held")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u32)
    }

    async fn rebuild_slots(&self, running: &[i64]) -> Result<u32> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SLOT_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE activations SET slot_held = FALSE WHERE slot_held")
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("UPDATE activations SET slot_held = TRUE WHERE id = ANY($1)")
            .bind(running)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(result.rows_affected() as u32)
    }

    async fn open_instance(
        &self,
        activation_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<ActivationInstance> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            r#"
            INSERT INTO activation_instances (activation_id, ordinal, started_at)
            SELECT $1, COALESCE(MAX(ordinal), 0) + 1, $2
            FROM activation_instances WHERE activation_id = $1
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(activation_id)
        .bind(started_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_open_instance_error(e, activation_id))?;

        row.try_into()
    }

    async fn set_instance_container(&self, instance_id: i64, container_id: &str) -> Result<()> {
        sqlx::query("UPDATE activation_instances SET container_id = $1 WHERE id = $2")
            .bind(container_id)
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close_instance(&self, instance_id: i64, close: &InstanceClose) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE activation_instances
            SET ended_at = $1, exit_code = $2, end_reason = $3, failure_reason = $4
            WHERE id = $5 AND ended_at IS NULL
            "#,
        )
        .bind(close.ended_at)
        .bind(close.exit_code)
        .bind(close.end_reason.as_str())
        .bind(&close.failure_reason)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_open_instance(&self, activation_id: i64) -> Result<Option<ActivationInstance>> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM activation_instances \
             WHERE activation_id = $1 AND ended_at IS NULL"
        ))
        .bind(activation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ActivationInstance::try_from).transpose()
    }

    async fn list_instances(&self, activation_id: i64) -> Result<Vec<ActivationInstance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM activation_instances \
             WHERE activation_id = $1 ORDER BY ordinal DESC"
        ))
        .bind(activation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ActivationInstance::try_from).collect()
    }

    async fn prune_instances(&self, activation_id: i64, keep: u32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM activation_instances
            WHERE activation_id = $1 AND ended_at IS NOT NULL
              AND id NOT IN (
                  SELECT id FROM activation_instances
                  WHERE activation_id = $1 AND ended_at IS NOT NULL
                  ORDER BY id DESC
                  LIMIT $2
              )
            "#,
        )
        .bind(activation_id)
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
