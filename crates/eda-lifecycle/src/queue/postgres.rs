// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed job queue.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use crate::error::Result;

use super::{
    EnqueueOutcome, JOB_COLUMNS, Job, JobAction, JobQueue, JobRow, PoolName, lease_deadline,
};

/// Advisory lock namespace for per-activation enqueue.
const ENQUEUE_LOCK_CLASS: i32 = 0x4544_4101;
/// Advisory lock namespace for per-pool claims.
const LEASE_LOCK_CLASS: i32 = 0x4544_4102;

/// PostgreSQL-backed job queue.
#[derive(Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
}

impl PostgresJobQueue {
    /// Create a queue over an already migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn pool_lock_key(pool: PoolName) -> i32 {
    match pool {
        PoolName::Default => 1,
        PoolName::Activation => 2,
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, activation_id: i64, action: JobAction) -> Result<EnqueueOutcome> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(ENQUEUE_LOCK_CLASS)
            .bind(activation_id as i32)
            .execute(&mut *tx)
            .await?;

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM jobs WHERE activation_id = $1 AND action = $2 \
             AND lease_owner IS NULL ORDER BY id LIMIT 1",
        )
        .bind(activation_id)
        .bind(action.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            Some((id,)) => EnqueueOutcome::Duplicate(id),
            None => {
                let now = Utc::now();
                let (id,): (i64,) = sqlx::query_as(
                    r#"
                    INSERT INTO jobs (pool, activation_id, action, priority, enqueued_at, not_before)
                    VALUES ($1, $2, $3, $4, $5, $5)
                    RETURNING id
                    "#,
                )
                .bind(action.pool().as_str())
                .bind(activation_id)
                .bind(action.as_str())
                .bind(action.priority())
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;
                EnqueueOutcome::Enqueued(id)
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn lease(
        &self,
        pool: PoolName,
        owner: &str,
        lease_for: Duration,
    ) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // The single-owner check reads other rows' leases, so claims on one
        // pool are serialized.
        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(LEASE_LOCK_CLASS)
            .bind(pool_lock_key(pool))
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET lease_owner = $1,
                leased_until = $2,
                retry_count = retry_count + CASE WHEN leased_until IS NULL THEN 0 ELSE 1 END
            WHERE id = (
                SELECT j.id FROM jobs j
                WHERE j.pool = $3
                  AND j.not_before <= $4
                  AND (j.leased_until IS NULL OR j.leased_until <= $4)
                  AND NOT EXISTS (
                      SELECT 1 FROM jobs o
                      WHERE o.pool = j.pool
                        AND o.activation_id = j.activation_id
                        AND o.id <> j.id
                        AND o.leased_until > $4
                  )
                ORDER BY j.priority DESC, j.id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(owner)
        .bind(lease_deadline(now, lease_for))
        .bind(pool.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;

        row.map(Job::try_from).transpose()
    }

    async fn extend_lease(&self, job_id: i64, owner: &str, lease_for: Duration) -> Result<bool> {
        let result =
            sqlx::query("UPDATE jobs SET leased_until = $1 WHERE id = $2 AND lease_owner = $3")
                .bind(lease_deadline(Utc::now(), lease_for))
                .bind(job_id)
                .bind(owner)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn ack(&self, job_id: i64, owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND lease_owner = $2")
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
                retry_count = retry_count + 1, not_before = $1
            WHERE id = $2 AND lease_owner = $3
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
        let actions: Vec<&str> = actions.iter().map(|a| a.as_str()).collect();
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM jobs WHERE activation_id = $1 AND action = ANY($2))",
        )
        .bind(activation_id)
        .bind(&actions)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn activations_with_jobs(&self, pool: PoolName) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT DISTINCT activation_id FROM jobs WHERE pool = $1 ORDER BY activation_id",
        )
        .bind(pool.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn purge(&self, activation_id: i64, keep: Option<i64>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE activation_id = $1 AND id <> $2")
            .bind(activation_id)
            .bind(keep.unwrap_or(-1))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn depth(&self, pool: PoolName) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE pool = $1")
            .bind(pool.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations;

    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("TEST_EDA_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        migrations::run_postgres(&pool).await.ok()?;
        Some(pool)
    }

    #[tokio::test]
    async fn test_enqueue_dedupes_waiting_job() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_EDA_DATABASE_URL not set");
            return;
        };
        let queue = PostgresJobQueue::new(pool);
        let activation_id = i64::from(rand_id());

        let first = queue.enqueue(activation_id, JobAction::Start).await.unwrap();
        let second = queue.enqueue(activation_id, JobAction::Start).await.unwrap();
        assert!(matches!(first, EnqueueOutcome::Enqueued(_)));
        assert_eq!(second, EnqueueOutcome::Duplicate(first.job_id()));

        queue.purge(activation_id, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_owner_per_activation() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_EDA_DATABASE_URL not set");
            return;
        };
        let queue = PostgresJobQueue::new(pool);
        let activation_id = i64::from(rand_id());

        queue.enqueue(activation_id, JobAction::Start).await.unwrap();
        queue.enqueue(activation_id, JobAction::Stop).await.unwrap();

        let leased: Vec<Job> = {
            let mut out = Vec::new();
            while let Some(job) = queue
                .lease(PoolName::Activation, "pg-test", Duration::from_secs(30))
                .await
                .unwrap()
            {
                out.push(job);
            }
            out
        };
        let mine: Vec<&Job> = leased
            .iter()
            .filter(|j| j.activation_id == activation_id)
            .collect();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].action, JobAction::Stop);

        for job in &leased {
            queue.ack(job.id, "pg-test").await.unwrap();
        }
        queue.purge(activation_id, None).await.unwrap();
    }

    fn rand_id() -> i32 {
        (uuid::Uuid::new_v4().as_u128() % 1_000_000) as i32 + 1_000_000
    }
}
