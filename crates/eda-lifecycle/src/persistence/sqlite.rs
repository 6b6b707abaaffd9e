// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::activation::{
    Activation, ActivationInstance, ActivationStatus, DesiredState, InstanceClose, Lifecycle,
    NewActivation,
};
use crate::error::Result;
use crate::migrations;

use super::{
    ACTIVATION_COLUMNS, ActivationRow, INSTANCE_COLUMNS, InstanceRow, Persistence, encode_spec,
    map_open_instance_error,
};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    ///
    /// In-memory databases get a single connection so every caller sees the
    /// same database.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = connect_pool(url).await?;
        Ok(Self { pool })
    }

    /// The underlying pool, shared with the job queue.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Open a migrated SQLite pool.
pub async fn connect_pool(url: &str) -> Result<SqlitePool> {
    let in_memory = url.contains(":memory:");
    let url = if in_memory || url.contains("mode=") {
        url.to_string()
    } else if url.contains('?') {
        format!("{url}&mode=rwc")
    } else {
        format!("{url}?mode=rwc")
    };

    let options = if in_memory {
        // Dropping the last connection would drop the database.
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };
    let pool = options.connect(&url).await?;
    migrations::run_sqlite(&pool).await?;
    Ok(pool)
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn create_activation(&self, new: &NewActivation) -> Result<Activation> {
        let (command, env) = encode_spec(new)?;
        let now = Utc::now();
        let row = sqlx::query_as::<_, ActivationRow>(&format!(
            r#"
            INSERT INTO activations (name, desired_state, image, command, env, restart_policy,
                                     restart_seconds_on_complete, restart_seconds_on_failure,
                                     status, restart_count, slot_held, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'stopped', 0, 0, ?, ?)
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
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_activation(&self, id: i64) -> Result<Option<Activation>> {
        let row = sqlx::query_as::<_, ActivationRow>(&format!(
            "SELECT {ACTIVATION_COLUMNS} FROM activations WHERE id = ?"
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
        let result =
            sqlx::query("UPDATE activations SET desired_state = ?, updated_at = ? WHERE id = ?")
                .bind(desired.as_str())
                .bind(Utc::now())
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
            SET status = ?, restart_count = ?, last_start_at = ?, last_exit_at = ?,
                failure_reason = ?, restart_after = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(lifecycle.status.as_str())
        .bind(lifecycle.restart_count as i64)
        .bind(lifecycle.last_start_at)
        .bind(lifecycle.last_exit_at)
        .bind(&lifecycle.failure_reason)
        .bind(lifecycle.restart_after)
        .bind(Utc::now())
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_activation(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM activations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn try_acquire_slot(&self, id: i64, cap: u32) -> Result<bool> {
        // One statement: SQLite serializes writers, so the count and the
        // flag flip cannot interleave with another acquire.
        let result = sqlx::query(
            r#"
            UPDATE activations
            SET slot_held = 1, updated_at = ?
            WHERE id = ? AND slot_held = 0
              AND (SELECT COUNT(*) FROM activations WHERE slot_held = 1) < ?
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .bind(cap as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_slot(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE activations SET slot_held = 0, updated_at = ? WHERE id = ? AND slot_held = 1",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_slots(&self) -> Result<u32> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM activations WHERE slot_held = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u32)
    }

    async fn rebuild_slots(&self, running: &[i64]) -> Result<u32> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE activations SET slot_held = 0 WHERE slot_held = 1")
            .execute(&mut *tx)
            .await?;

        let mut held = 0u32;
        for id in running {
            let result = sqlx::query("UPDATE activations SET slot_held = 1 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                held += 1;
            }
        }
        tx.commit().await?;
        Ok(held)
    }

    async fn open_instance(
        &self,
        activation_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<ActivationInstance> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            r#"
            INSERT INTO activation_instances (activation_id, ordinal, started_at)
            SELECT ?, COALESCE(MAX(ordinal), 0) + 1, ?
            FROM activation_instances WHERE activation_id = ?
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(activation_id)
        .bind(started_at)
        .bind(activation_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_open_instance_error(e, activation_id))?;

        row.try_into()
    }

    async fn set_instance_container(&self, instance_id: i64, container_id: &str) -> Result<()> {
        sqlx::query("UPDATE activation_instances SET container_id = ? WHERE id = ?")
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
            SET ended_at = ?, exit_code = ?, end_reason = ?, failure_reason = ?
            WHERE id = ? AND ended_at IS NULL
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
             WHERE activation_id = ? AND ended_at IS NULL"
        ))
        .bind(activation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ActivationInstance::try_from).transpose()
    }

    async fn list_instances(&self, activation_id: i64) -> Result<Vec<ActivationInstance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM activation_instances \
             WHERE activation_id = ? ORDER BY ordinal DESC"
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
            WHERE activation_id = ? AND ended_at IS NOT NULL
              AND id NOT IN (
                  SELECT id FROM activation_instances
                  WHERE activation_id = ? AND ended_at IS NOT NULL
                  ORDER BY id DESC
                  LIMIT ?
              )
            "#,
        )
        .bind(activation_id)
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
