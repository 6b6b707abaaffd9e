// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activation worker tests: idempotent starts, restart policy, stop and
//! delete sweeps, and recovery of interrupted runs.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::TestContext;
use eda_lifecycle::activation::{ActivationStatus, EndReason, NewActivation, RestartPolicy};
use eda_lifecycle::container::{ContainerRuntime, ContainerSpec};
use eda_lifecycle::error::Error;
use eda_lifecycle::persistence::Persistence;
use eda_lifecycle::queue::{JobAction, JobQueue, PoolName};
use eda_lifecycle::worker::{JobContext, JobHandler};
use eda_lifecycle::worker_pool::Processed;

#[tokio::test]
async fn test_redelivered_start_does_not_spawn_twice() {
    let ctx = TestContext::new().await;
    let a = ctx.create("a").await;
    ctx.scheduler.tick().await.unwrap();

    // First delivery: the handler runs but its lease lapses before the ack.
    let first = ctx
        .queue
        .lease(PoolName::Activation, "worker-1", Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.action, JobAction::Start);
    let lease = JobContext::new(ctx.queue.clone(), first.id, "worker-1", Duration::ZERO);
    ctx.worker.handle(&first, &lease).await.unwrap();
    assert_eq!(ctx.activation(a.id).await.status, ActivationStatus::Running);

    tokio::time::sleep(Duration::from_millis(20)).await;

    // Second delivery of the same job.
    let second = ctx
        .queue
        .lease(PoolName::Activation, "worker-2", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.retry_count, 1);
    let lease = JobContext::new(ctx.queue.clone(), second.id, "worker-2", Duration::from_secs(30));
    let err = ctx.worker.handle(&second, &lease).await.unwrap_err();
    assert!(matches!(err, Error::LeaseExpiredDuplicate { .. }));

    assert_eq!(ctx.runtime.created_count(), 1);
    assert_eq!(ctx.runtime.running_count().await, 1);
    let instances = ctx.instances(a.id).await;
    assert_eq!(instances.len(), 1);
    assert!(instances[0].is_open());

    // Only the current owner can ack.
    assert!(!ctx.queue.ack(first.id, "worker-1").await.unwrap());
    assert!(ctx.queue.ack(second.id, "worker-2").await.unwrap());
}

#[tokio::test]
async fn test_duplicate_start_is_acked_by_pool() {
    let ctx = TestContext::new().await;
    let a = ctx.create("a").await;
    ctx.cycle().await;

    // A second Start for an already running activation, e.g. enqueued by a
    // scheduler that read stale state.
    ctx.queue.purge(a.id, None).await.unwrap();
    ctx.queue.enqueue(a.id, JobAction::Start).await.unwrap();

    let processed = ctx.activation_pool.process_next().await.unwrap();
    assert_eq!(processed, Some(Processed::Duplicate));
    assert_eq!(ctx.runtime.created_count(), 1);
    assert!(ctx.queue.has_pending(a.id, &[JobAction::Monitor]).await.unwrap());
    assert!(!ctx.queue.has_pending(a.id, &[JobAction::Start]).await.unwrap());
}

#[tokio::test]
async fn test_rejected_spawns_exhaust_restart_cap() {
    let ctx = TestContext::with_overrides(&[
        ("EDA_ACTIVATION_MAX_RESTARTS_ON_FAILURE", "2"),
        ("EDA_ACTIVATION_RESTART_SECONDS_ON_FAILURE", "0"),
    ])
    .await;
    let a = ctx.create("a").await;
    ctx.runtime.set_reject_spawns(true);

    for expected in 1..=2 {
        ctx.cycle().await;
        let failed = ctx.activation(a.id).await;
        assert_eq!(failed.status, ActivationStatus::Failed);
        assert_eq!(failed.restart_count, expected);
        assert_eq!(ctx.held().await, 0);
    }

    ctx.cycle().await;
    let errored = ctx.activation(a.id).await;
    assert_eq!(errored.status, ActivationStatus::Errored);
    assert_eq!(errored.restart_count, 3);
    assert_eq!(errored.restart_after, None);

    let report = ctx.scheduler.tick().await.unwrap();
    assert!(report.admitted.is_empty());

    let instances = ctx.instances(a.id).await;
    assert_eq!(instances.len(), 3);
    assert!(
        instances
            .iter()
            .all(|i| i.end_reason == Some(EndReason::StartFailed))
    );

    // Enabling an errored activation resets it.
    ctx.runtime.set_reject_spawns(false);
    ctx.service.enable(a.id).await.unwrap();
    ctx.pump().await;
    let reset = ctx.activation(a.id).await;
    assert_eq!(reset.status, ActivationStatus::Stopped);
    assert_eq!(reset.restart_count, 0);

    ctx.cycle().await;
    assert_eq!(ctx.activation(a.id).await.status, ActivationStatus::Running);
}

#[tokio::test]
async fn test_runtime_outage_does_not_count_against_cap() {
    let ctx = TestContext::with_overrides(&[
        ("EDA_ACTIVATION_MAX_RESTARTS_ON_FAILURE", "2"),
        ("EDA_ACTIVATION_RESTART_SECONDS_ON_FAILURE", "0"),
    ])
    .await;
    let a = ctx.create_with(NewActivation {
        restart_policy: RestartPolicy::Never,
        ..NewActivation::new("a", common::IMAGE)
    })
    .await;
    ctx.runtime.set_unavailable(true);

    for _ in 0..5 {
        ctx.cycle().await;
        let failed = ctx.activation(a.id).await;
        assert_eq!(failed.status, ActivationStatus::Failed);
        assert_eq!(failed.restart_count, 0);
        assert!(failed.restart_after.is_some());
    }

    ctx.runtime.set_unavailable(false);
    ctx.cycle().await;
    assert_eq!(ctx.activation(a.id).await.status, ActivationStatus::Running);
}

#[tokio::test]
async fn test_lost_container_counts_as_failure() {
    let ctx = TestContext::new().await;
    let a = ctx.create("a").await;
    ctx.cycle().await;

    let container_id = ctx.runtime.running_for(a.id).await.remove(0);
    ctx.runtime.vanish(&container_id).await;
    ctx.pump().await;

    let failed = ctx.activation(a.id).await;
    assert_eq!(failed.status, ActivationStatus::Failed);
    assert_eq!(failed.restart_count, 1);
    assert_eq!(failed.failure_reason.as_deref(), Some("container lost"));

    let instances = ctx.instances(a.id).await;
    assert_eq!(instances[0].end_reason, Some(EndReason::Lost));
    assert_eq!(instances[0].exit_code, None);
}

#[tokio::test]
async fn test_clean_exit_with_on_failure_policy_stays_completed() {
    let ctx = TestContext::new().await;
    let a = ctx.create_with(NewActivation {
        restart_policy: RestartPolicy::OnFailure,
        ..NewActivation::new("a", common::IMAGE)
    })
    .await;
    ctx.cycle().await;
    ctx.runtime.exit_activation(a.id, 0).await;
    ctx.pump().await;

    let done = ctx.activation(a.id).await;
    assert_eq!(done.status, ActivationStatus::Completed);
    assert_eq!(done.restart_after, None);

    let report = ctx.scheduler.tick().await.unwrap();
    assert!(report.admitted.is_empty());
    assert_eq!(ctx.instances(a.id).await[0].exit_code, Some(0));
}

#[tokio::test]
async fn test_at_most_one_open_instance_across_restarts() {
    let ctx = TestContext::with_overrides(&[("EDA_ACTIVATION_RESTART_SECONDS_ON_FAILURE", "0")])
        .await;
    let a = ctx.create("a").await;

    for (run, code) in [0, 1, 0, 137].into_iter().enumerate() {
        ctx.cycle().await;
        let instances = ctx.instances(a.id).await;
        assert_eq!(instances.len(), run + 1);
        assert_eq!(instances.iter().filter(|i| i.is_open()).count(), 1);
        assert_eq!(ctx.runtime.running_count().await, 1);

        ctx.runtime.exit_activation(a.id, code).await;
        ctx.pump().await;
        let instances = ctx.instances(a.id).await;
        assert!(instances.iter().all(|i| !i.is_open()));
    }

    let ordinals: Vec<i32> = ctx.instances(a.id).await.iter().map(|i| i.ordinal).collect();
    assert_eq!(ordinals, vec![4, 3, 2, 1]);
    assert_eq!(ctx.runtime.running_count().await, 0);
}

#[tokio::test]
async fn test_stop_sweeps_every_labelled_container() {
    let ctx = TestContext::new().await;
    let a = ctx.create("a").await;
    ctx.cycle().await;

    let activation = ctx.activation(a.id).await;
    ctx.runtime
        .adopt_running(ContainerSpec::for_activation(&activation, 9_999, 99))
        .await;
    assert_eq!(ctx.runtime.running_for(a.id).await.len(), 2);

    ctx.service.disable(a.id).await.unwrap();
    ctx.pump().await;

    assert!(ctx.runtime.running_for(a.id).await.is_empty());
    assert_eq!(ctx.activation(a.id).await.status, ActivationStatus::Stopped);
}

#[tokio::test]
async fn test_delete_removes_activation_containers_and_jobs() {
    let ctx = TestContext::new().await;
    let a = ctx.create("a").await;
    ctx.cycle().await;

    ctx.service.delete(a.id).await.unwrap();
    ctx.pump().await;

    assert!(matches!(
        ctx.service.get(a.id).await,
        Err(Error::ActivationNotFound(_))
    ));
    assert_eq!(ctx.runtime.running_count().await, 0);
    assert_eq!(ctx.queue.depth(PoolName::Activation).await.unwrap(), 0);
    assert_eq!(ctx.held().await, 0);
}

#[tokio::test]
async fn test_interrupted_start_without_container_is_closed() {
    let ctx = TestContext::new().await;
    let a = ctx.create("a").await;
    // A previous worker opened the instance and died before the engine call.
    ctx.persistence.open_instance(a.id, Utc::now()).await.unwrap();

    ctx.cycle().await;

    assert_eq!(ctx.activation(a.id).await.status, ActivationStatus::Running);
    let instances = ctx.instances(a.id).await;
    assert_eq!(instances.len(), 2);
    assert!(instances[0].is_open());
    assert_eq!(instances[1].end_reason, Some(EndReason::StartFailed));
    assert_eq!(instances[1].failure_reason.as_deref(), Some("interrupted"));
}

#[tokio::test]
async fn test_interrupted_start_with_container_is_adopted() {
    let ctx = TestContext::new().await;
    let a = ctx.create("a").await;
    // A previous worker started the container but never recorded its id.
    let instance = ctx.persistence.open_instance(a.id, Utc::now()).await.unwrap();
    let activation = ctx.activation(a.id).await;
    ctx.runtime
        .adopt_running(ContainerSpec::for_activation(
            &activation,
            instance.id,
            instance.ordinal,
        ))
        .await;

    ctx.cycle().await;

    assert_eq!(ctx.activation(a.id).await.status, ActivationStatus::Running);
    assert_eq!(ctx.runtime.created_count(), 0);
    assert_eq!(ctx.runtime.running_count().await, 1);
    let instances = ctx.instances(a.id).await;
    assert_eq!(instances.len(), 1);
    assert!(instances[0].container_id.is_some());
}

#[tokio::test]
async fn test_history_is_pruned_after_runs() {
    let ctx = TestContext::with_overrides(&[
        ("EDA_ACTIVATION_HISTORY_LIMIT", "2"),
        ("EDA_ACTIVATION_RESTART_SECONDS_ON_FAILURE", "0"),
    ])
    .await;
    let a = ctx.create("a").await;

    for _ in 0..4 {
        ctx.cycle().await;
        ctx.runtime.exit_activation(a.id, 1).await;
        ctx.pump().await;
    }
    assert_eq!(ctx.instances(a.id).await.len(), 4);

    assert!(ctx.pump_default().await > 0);
    let kept: Vec<i32> = ctx.instances(a.id).await.iter().map(|i| i.ordinal).collect();
    assert_eq!(kept, vec![4, 3]);
}

#[tokio::test]
async fn test_runtime_reports_labels_for_started_containers() {
    let ctx = TestContext::new().await;
    let a = ctx.create("a").await;
    ctx.cycle().await;

    let managed = ctx.runtime.list_managed().await.unwrap();
    assert_eq!(managed.len(), 1);
    assert_eq!(managed[0].activation_id, a.id);
    let instance = ctx.persistence.get_open_instance(a.id).await.unwrap().unwrap();
    assert_eq!(managed[0].instance_id, Some(instance.id));
    assert_eq!(instance.container_id.as_deref(), Some(managed[0].container_id.as_str()));
}

#[tokio::test]
async fn test_restart_replaces_running_container() {
    let ctx = TestContext::new().await;
    let a = ctx.create("a").await;
    ctx.cycle().await;
    let first = ctx.runtime.running_for(a.id).await;

    ctx.service.restart(a.id).await.unwrap();
    ctx.pump().await;
    let reset = ctx.activation(a.id).await;
    assert_eq!(reset.status, ActivationStatus::Stopped);
    assert!(!reset.slot_held);
    assert_eq!(ctx.runtime.running_count().await, 0);

    ctx.cycle().await;
    assert_eq!(ctx.activation(a.id).await.status, ActivationStatus::Running);
    let second = ctx.runtime.running_for(a.id).await;
    assert_eq!(second.len(), 1);
    assert_ne!(first, second);
    assert_eq!(ctx.runtime.created_count(), 2);
}

#[tokio::test]
async fn test_failed_supervision_keeps_slot_of_running_container() {
    let ctx = TestContext::with_overrides(&[("EDA_MAX_RUNNING_ACTIVATIONS", "1")]).await;
    let a = ctx.create("a").await;
    let b = ctx.create("b").await;

    let report = ctx.scheduler.tick().await.unwrap();
    assert_eq!(report.admitted, vec![a.id]);

    // The container starts, then every status poll hits an engine error.
    ctx.runtime.set_fail_observe(true);
    let processed = ctx.activation_pool.process_next().await.unwrap();
    assert_eq!(processed, Some(Processed::DeadLettered));

    let running = ctx.activation(a.id).await;
    assert_eq!(running.status, ActivationStatus::Running);
    assert!(running.slot_held);
    assert_eq!(ctx.held().await, 1);
    assert_eq!(ctx.runtime.running_count().await, 1);

    let report = ctx.scheduler.tick().await.unwrap();
    assert!(report.admitted.is_empty());
    assert_eq!(report.deferred, vec![b.id]);
    assert_eq!(report.monitored, vec![a.id]);

    ctx.runtime.set_fail_observe(false);
    ctx.pump().await;
    ctx.cycle().await;
    assert_eq!(ctx.runtime.running_count().await, 1);
    assert_eq!(ctx.runtime.created_count(), 1);
    assert_eq!(ctx.activation(b.id).await.status, ActivationStatus::Stopped);
    assert_eq!(ctx.held().await, 1);
}

#[tokio::test]
async fn test_dead_lettered_start_without_container_releases_slot() {
    let ctx = TestContext::new().await;
    let a = ctx.create("a").await;
    ctx.scheduler.tick().await.unwrap();
    assert_eq!(ctx.held().await, 1);

    let job = ctx
        .queue
        .lease(PoolName::Activation, "worker-1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.action, JobAction::Start);

    ctx.worker.on_dead_letter(&job).await.unwrap();
    assert!(!ctx.activation(a.id).await.slot_held);
    assert_eq!(ctx.held().await, 0);
}
