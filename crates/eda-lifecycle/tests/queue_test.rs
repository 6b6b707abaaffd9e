// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job queue tests against SQLite: leases, redelivery, dedupe and ordering.

use std::time::Duration;

use eda_lifecycle::persistence::SqlitePersistence;
use eda_lifecycle::queue::{EnqueueOutcome, JobAction, JobQueue, PoolName, SqliteJobQueue};

const LEASE: Duration = Duration::from_secs(30);

async fn queue() -> SqliteJobQueue {
    let persistence = SqlitePersistence::connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite persistence");
    SqliteJobQueue::new(persistence.pool().clone())
}

#[tokio::test]
async fn test_leased_job_is_exclusive() {
    let queue = queue().await;
    queue.enqueue(1, JobAction::Start).await.unwrap();

    let job = queue
        .lease(PoolName::Activation, "a", LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.activation_id, 1);
    assert_eq!(job.lease_owner.as_deref(), Some("a"));
    assert_eq!(job.retry_count, 0);

    assert!(queue.lease(PoolName::Activation, "b", LEASE).await.unwrap().is_none());
    assert!(queue.lease(PoolName::Default, "b", LEASE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed_with_retry_bump() {
    let queue = queue().await;
    queue.enqueue(1, JobAction::Start).await.unwrap();

    let first = queue
        .lease(PoolName::Activation, "a", Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = queue
        .lease(PoolName::Activation, "b", LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.retry_count, 1);

    // The previous holder lost every right over the job.
    assert!(!queue.ack(first.id, "a").await.unwrap());
    assert!(!queue.extend_lease(first.id, "a", LEASE).await.unwrap());
    assert!(!queue.retry(first.id, "a", Duration::ZERO).await.unwrap());
    assert!(queue.extend_lease(second.id, "b", LEASE).await.unwrap());
    assert!(queue.ack(second.id, "b").await.unwrap());
}

#[tokio::test]
async fn test_enqueue_dedupes_against_waiting_jobs_only() {
    let queue = queue().await;
    let first = queue.enqueue(1, JobAction::Monitor).await.unwrap();
    let again = queue.enqueue(1, JobAction::Monitor).await.unwrap();
    assert!(matches!(first, EnqueueOutcome::Enqueued(_)));
    assert_eq!(again, EnqueueOutcome::Duplicate(first.job_id()));

    // Other actions and other activations are distinct.
    assert!(matches!(
        queue.enqueue(1, JobAction::Stop).await.unwrap(),
        EnqueueOutcome::Enqueued(_)
    ));
    assert!(matches!(
        queue.enqueue(2, JobAction::Monitor).await.unwrap(),
        EnqueueOutcome::Enqueued(_)
    ));

    // Once leased, a waiting copy may be queued behind it.
    queue.purge(1, None).await.unwrap();
    queue.purge(2, None).await.unwrap();
    queue.enqueue(1, JobAction::Monitor).await.unwrap();
    let leased = queue
        .lease(PoolName::Activation, "a", LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leased.activation_id, 1);
    let queued = queue.enqueue(1, JobAction::Monitor).await.unwrap();
    assert!(matches!(queued, EnqueueOutcome::Enqueued(id) if id != leased.id));
}

#[tokio::test]
async fn test_stop_actions_are_claimed_first() {
    let queue = queue().await;
    queue.enqueue(1, JobAction::Start).await.unwrap();
    queue.enqueue(2, JobAction::Monitor).await.unwrap();
    queue.enqueue(3, JobAction::Delete).await.unwrap();
    queue.enqueue(4, JobAction::Stop).await.unwrap();

    let mut order = Vec::new();
    while let Some(job) = queue.lease(PoolName::Activation, "a", LEASE).await.unwrap() {
        order.push(job.action);
    }
    assert_eq!(
        order,
        vec![JobAction::Delete, JobAction::Stop, JobAction::Start, JobAction::Monitor]
    );
}

#[tokio::test]
async fn test_one_owner_per_activation() {
    let queue = queue().await;
    queue.enqueue(1, JobAction::Monitor).await.unwrap();
    queue.enqueue(1, JobAction::Stop).await.unwrap();
    queue.enqueue(2, JobAction::Start).await.unwrap();

    let stop = queue
        .lease(PoolName::Activation, "a", LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!((stop.activation_id, stop.action), (1, JobAction::Stop));

    // Activation 1's Monitor waits while its Stop is held.
    let other = queue
        .lease(PoolName::Activation, "b", LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(other.activation_id, 2);
    assert!(queue.lease(PoolName::Activation, "c", LEASE).await.unwrap().is_none());

    queue.ack(stop.id, "a").await.unwrap();
    let monitor = queue
        .lease(PoolName::Activation, "c", LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!((monitor.activation_id, monitor.action), (1, JobAction::Monitor));
}

#[tokio::test]
async fn test_retry_delays_redelivery() {
    let queue = queue().await;
    queue.enqueue(1, JobAction::Start).await.unwrap();

    let job = queue
        .lease(PoolName::Activation, "a", LEASE)
        .await
        .unwrap()
        .unwrap();
    assert!(queue.retry(job.id, "a", Duration::from_secs(60)).await.unwrap());
    assert!(queue.lease(PoolName::Activation, "a", LEASE).await.unwrap().is_none());

    queue.enqueue(1, JobAction::Monitor).await.unwrap();
    let next = queue
        .lease(PoolName::Activation, "a", LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.action, JobAction::Monitor);
    assert!(queue.ack(next.id, "a").await.unwrap());

    let job = queue.lease(PoolName::Activation, "a", LEASE).await.unwrap();
    assert!(job.is_none());
    assert_eq!(queue.depth(PoolName::Activation).await.unwrap(), 1);
}

#[tokio::test]
async fn test_retried_job_is_redelivered_with_count() {
    let queue = queue().await;
    queue.enqueue(1, JobAction::Start).await.unwrap();

    let job = queue
        .lease(PoolName::Activation, "a", LEASE)
        .await
        .unwrap()
        .unwrap();
    assert!(queue.retry(job.id, "a", Duration::ZERO).await.unwrap());

    let again = queue
        .lease(PoolName::Activation, "b", LEASE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id, job.id);
    assert_eq!(again.retry_count, 1);
}

#[tokio::test]
async fn test_purge_keeps_the_running_job() {
    let queue = queue().await;
    queue.enqueue(1, JobAction::Start).await.unwrap();
    queue.enqueue(1, JobAction::Monitor).await.unwrap();
    let delete = queue.enqueue(1, JobAction::Delete).await.unwrap().job_id();
    queue.enqueue(1, JobAction::PruneHistory).await.unwrap();
    queue.enqueue(2, JobAction::Start).await.unwrap();

    assert_eq!(queue.purge(1, Some(delete)).await.unwrap(), 3);
    assert_eq!(queue.depth(PoolName::Activation).await.unwrap(), 2);
    assert_eq!(queue.depth(PoolName::Default).await.unwrap(), 0);
    assert!(queue.has_pending(1, &[JobAction::Delete]).await.unwrap());
    assert!(!queue.has_pending(1, &[JobAction::Start, JobAction::Monitor]).await.unwrap());
}

#[tokio::test]
async fn test_pending_and_activations_with_jobs() {
    let queue = queue().await;
    assert!(!queue.has_pending(1, &[]).await.unwrap());

    queue.enqueue(3, JobAction::Monitor).await.unwrap();
    queue.enqueue(1, JobAction::Start).await.unwrap();
    queue.enqueue(1, JobAction::Stop).await.unwrap();
    queue.enqueue(2, JobAction::PruneHistory).await.unwrap();

    assert!(queue.has_pending(1, &[JobAction::Stop, JobAction::Delete]).await.unwrap());
    assert!(!queue.has_pending(3, &[JobAction::Stop]).await.unwrap());
    assert_eq!(
        queue.activations_with_jobs(PoolName::Activation).await.unwrap(),
        vec![1, 3]
    );
    assert_eq!(
        queue.activations_with_jobs(PoolName::Default).await.unwrap(),
        vec![2]
    );

    // A leased job still counts.
    let leased = queue
        .lease(PoolName::Default, "m", LEASE)
        .await
        .unwrap()
        .unwrap();
    assert!(queue.has_pending(2, &[JobAction::PruneHistory]).await.unwrap());
    queue.ack(leased.id, "m").await.unwrap();
    assert!(queue.activations_with_jobs(PoolName::Default).await.unwrap().is_empty());
}
