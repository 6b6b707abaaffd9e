// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed job queue.
//!
//! Every mutation is a single statement; SQLite's serialized writer makes the
//! claim in [`SqliteJobQueue::lease`] atomic without row locks. Timestamps are
//! stored as RFC 3339 text and compared through `julianday()`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::{Error, Result};

use super::{
    EnqueueOutcome, JOB_COLUMNS, Job, JobAction, JobQueue, JobRow, PoolName, lease_deadline,
};

/// SQLite-backed job queue.
#[derive(Clone)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
}

impl SqliteJobQueue {
    /// Create a queue over an already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, activation_id: i64, action: JobAction) -> Result<EnqueueOutcome> {
        // Insert and duplicate lookup race with a concurrent ack; one retry
        // settles it.
        for _ in 0..2 {
            let now = Utc::now();
            let inserted: Option<(i64,)> = sqlx::query_as(
                r#"
                INSERT INTO jobs (pool, activation_id, action, priority, enqueued_at, not_before)
                SELECT ?, ?, ?, ?, ?, ?
                WHERE NOT EXISTS (
                    SELECT 1 FROM jobs
                    WHERE activation_id = ? AND action = ? AND lease_owner IS NULL
                )
                RETURNING id
                "#,
            )
            .bind(action.pool().as_str())
            .bind(activation_id)
            .bind(action.as_str())
            .bind(action.priority())
            .bind(now)
            .bind(now)
            .bind(activation_id)
            .bind(action.as_str())
            .fetch_optional(&self.pool)
            .await?;

            if let Some((id,)) = inserted {
                return Ok(EnqueueOutcome::Enqueued(id));
            }

            let existing: Option<(i64,)> = sqlx::query_as(
                "SELECT id FROM jobs WHERE activation_id = ? AND action = ? \
                 AND lease_owner IS NULL ORDER BY id LIMIT 1",
            )
            .bind(activation_id)
            .bind(action.as_str())
            .fetch_optional(&self.pool)
            .await?;

            if let Some((id,)) = existing {
                return Ok(EnqueueOutcome::Duplicate(id));
            }
        }

        Err(Error::Other(format!(
            "could not enqueue {action} for activation {activation_id}"
        )))
    }

    async fn lease(
        &self,
        pool: PoolName,
        owner: &str,
        lease_for: Duration,
    ) -> Result<Option<Job>> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET lease_owner = ?1,
                leased_until = ?2,
                retry_count = retry_count + CASE WHEN leased_until IS NULL THEN 0 ELSE 1 END
            WHERE id = (
                SELECT j.id FROM jobs j
                WHERE j.pool = ?3
                  AND julianday(j.not_before) <= julianday(?4)
                  AND (j.leased_until IS NULL OR julianday(j.leased_until) <= julianday(?4))
                  AND NOT EXISTS (
                      SELECT 1 FROM jobs o
                      WHERE o.pool = j.pool
                        AND o.activation_id = j.activation_id
                        AND o.id != j.id
                        AND o.leased_until IS NOT NULL
                        AND julianday(o.leased_until) > julianday(?4)
                  )
                ORDER BY j.priority DESC, j.id ASC
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(owner)
        .bind(lease_deadline(now, lease_for))
        .bind(pool.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn extend_lease(&self, job_id: i64, owner: &str, lease_for: Duration) -> Result<bool> {
        let result =
            sqlx::query("UPDATE jobs SET leased_until = ? WHERE id = ? AND lease_owner = ?")
                .bind(lease_deadline(Utc::now(), lease_for))
                .bind(job_id)
                .bind(owner)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn ack(&self, job_id: i64, owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ? AND lease_owner = ?")
            .bind(job_id)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn retry(&self, job_id: i64, owner: &str, delay: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_owner = NULL, leased_until = NULL,
                retry_count = retry_count + 1, not_before = ?
            WHERE id = ? AND lease_owner = ?
            "#,
        )
        .bind(lease_deadline(Utc::now(), delay))
        .bind(job_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn has_pending(&self, activation_id: i64, actions: &[JobAction]) -> Result<bool> {
        if actions.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; actions.len()].join(", ");
        let sql = format!(
            "SELECT COUNT(*) FROM jobs WHERE activation_id = ? AND action IN ({placeholders})"
        );
        let mut query = sqlx::query_as::<_, (i64,)>(&sql).bind(activation_id);
        for action in actions {
            query = query.bind(action.as_str());
        }
        let (count,) = query.fetch_one(&self.pool).await?;
        Ok(count > 0)
    }

    async fn activations_with_jobs(&self, pool: PoolName) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT DISTINCT activation_id FROM jobs WHERE pool = ? ORDER BY activation_id",
        )
        .bind(pool.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn purge(&self, activation_id: i64, keep: Option<i64>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE activation_id = ? AND id != ?")
            .bind(activation_id)
            .bind(keep.unwrap_or(-1))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn depth(&self, pool: PoolName) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE pool = ?")
            .bind(pool.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }
}
