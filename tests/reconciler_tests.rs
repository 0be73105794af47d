
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use aggwork::asg_instance::{AsgInstance, InstanceStatus};
use aggwork::clock::Clock;
use aggwork::fleet::{FleetError, InstanceStateReconciler, LifecycleClient};
use aggwork::metrics;
use aggwork::retry::BackoffPolicy;
use aggwork::store::{AsgInstanceStore, InMemoryAsgInstanceStore, StoreError};
use test_helpers::*;

/// Lists from a snapshot taken earlier, so writes made after the snapshot
/// are invisible to the listing but not to `get` or `update`.
struct SnapshotListing {
    inner: Arc<InMemoryAsgInstanceStore>,
    snapshot: Vec<AsgInstance>,
}

#[async_trait]
impl AsgInstanceStore for SnapshotListing {
    async fn get(&self, instance_name: &str) -> Result<Option<AsgInstance>, StoreError> {
        self.inner.get(instance_name).await
    }

    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<AsgInstance>, StoreError> {
        Ok(self
            .snapshot
            .iter()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    async fn upsert(&self, instance: AsgInstance) -> Result<(), StoreError> {
        self.inner.upsert(instance).await
    }

    async fn update(&self, instance: AsgInstance) -> Result<AsgInstance, StoreError> {
        self.inner.update(instance).await
    }
}

fn ids(zone: &[aggwork::cloud::ComputeInstance]) -> Vec<&str> {
    zone.iter().map(|i| i.instance_id.as_str()).collect()
}

#[aggwork::test]
async fn overdue_instance_is_deleted_and_terminated() {
    let h = FleetHarness::new();
    let a = h.add("zone-a", &["i1", "i2"]).await;
    let b = h.add("zone-b", &["j1"]).await;
    h.mark_waiting(&a[0], T0).await;

    h.clock.set(T0 + WAIT.as_millis() as i64 + 1);
    let zones = h.reconciler().manage_instances().await.expect("reconcile");

    assert_eq!(h.group.delete_calls().await, vec![vec![a[0].clone()]]);
    let record = h.record(&a[0]).await.unwrap();
    assert_eq!(record.status, InstanceStatus::Terminated);
    assert_eq!(record.termination_time, Some(h.clock.now_ms()));
    assert_eq!(record.request_time, T0);

    assert_eq!(ids(&zones["zone-a"]), vec![a[1].as_str()]);
    assert_eq!(ids(&zones["zone-b"]), vec![b[0].as_str()]);
}

#[aggwork::test]
async fn waiting_instance_within_timeout_is_left_alone() {
    let h = FleetHarness::new();
    let a = h.add("zone-a", &["i1", "i2"]).await;
    h.mark_waiting(&a[0], T0).await;

    // Exactly at the deadline is not yet overdue.
    h.clock.set(T0 + WAIT.as_millis() as i64);
    let zones = h.reconciler().manage_instances().await.unwrap();

    assert!(h.group.delete_calls().await.is_empty());
    let record = h.record(&a[0]).await.unwrap();
    assert_eq!(record.status, InstanceStatus::TerminatingWait);
    assert_eq!(record.termination_time, None);
    // A draining instance is not offered to the planner.
    assert_eq!(ids(&zones["zone-a"]), vec![a[1].as_str()]);
}

#[aggwork::test]
async fn vanished_instance_is_terminated_without_deletion() {
    let h = FleetHarness::new();
    let a = h.add("zone-a", &["i1"]).await;
    let gone = instance("zone-a", "gone", TEMPLATE).instance_id;
    h.mark_waiting(&gone, T0).await;

    h.clock.advance(Duration::from_secs(30));
    let zones = h.reconciler().manage_instances().await.unwrap();

    assert!(h.group.delete_calls().await.is_empty());
    let record = h.record(&gone).await.unwrap();
    assert_eq!(record.status, InstanceStatus::Terminated);
    assert_eq!(record.termination_time, Some(T0 + 30_000));
    assert_eq!(ids(&zones["zone-a"]), vec![a[0].as_str()]);
}

#[aggwork::test]
async fn second_pass_changes_nothing() {
    let h = FleetHarness::new();
    let metrics = metrics::init().unwrap();
    let a = h.add("zone-a", &["i1", "i2"]).await;
    let gone = instance("zone-b", "gone", TEMPLATE).instance_id;
    h.mark_waiting(&a[0], T0).await;
    h.mark_waiting(&gone, T0).await;
    h.clock.set(T0 + WAIT.as_millis() as i64 + 1);

    let reconciler = h.reconciler().with_metrics(metrics.clone());
    let first = reconciler.manage_instances().await.unwrap();
    let records_after_first = h.instances.all().await;

    h.clock.advance(Duration::from_secs(60));
    let second = reconciler.manage_instances().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.group.delete_calls().await.len(), 1);
    assert_eq!(h.instances.all().await, records_after_first);

    let rendered = String::from_utf8(metrics::render(&metrics).unwrap()).unwrap();
    assert!(rendered.contains("aggwork_instances_terminated_total 2"));
    assert!(rendered.contains("aggwork_instance_deletions_total 1"));
}

#[aggwork::test(start_paused = true)]
async fn slow_deletion_completes_after_polling() {
    let h = FleetHarness::new();
    let a = h.add("zone-a", &["i1"]).await;
    h.mark_waiting(&a[0], T0).await;
    h.group.set_polls_to_finish(Some(2)).await;
    h.clock.set(T0 + WAIT.as_millis() as i64 + 1);

    let started = tokio::time::Instant::now();
    h.reconciler().manage_instances().await.unwrap();
    // Two failed polls, waiting 2s then 4s.
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(6) && waited < Duration::from_secs(7));

    assert!(h.group.instance_ids().await.is_empty());
    assert_eq!(
        h.record(&a[0]).await.unwrap().status,
        InstanceStatus::Terminated
    );
}

#[aggwork::test(start_paused = true)]
async fn deletion_that_never_finishes_gives_up_after_seven_polls() {
    let h = FleetHarness::new();
    let a = h.add("zone-a", &["i1"]).await;
    h.mark_waiting(&a[0], T0).await;
    h.group.set_polls_to_finish(None).await;
    h.clock.set(T0 + WAIT.as_millis() as i64 + 1);

    let started = tokio::time::Instant::now();
    let err = h.reconciler().manage_instances().await.unwrap_err();
    match err {
        FleetError::DeletionIncomplete {
            instance_ids,
            polls,
        } => {
            assert_eq!(instance_ids, vec![a[0].clone()]);
            assert_eq!(polls, 7);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // 2 + 4 + 8 + 16 + 32 + 64 seconds between the seven polls.
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(126) && waited < Duration::from_secs(127));

    // The record is left for the next tick to retry.
    assert_eq!(
        h.record(&a[0]).await.unwrap().status,
        InstanceStatus::TerminatingWait
    );
}

#[aggwork::test]
async fn instance_terminated_by_its_worker_mid_pass_is_not_an_error() {
    let h = FleetHarness::new();
    let a = h.add("zone-a", &["i1"]).await;
    h.mark_waiting("gone-1", T0).await;
    h.mark_waiting("gone-2", T0).await;
    let snapshot = h
        .instances
        .list_by_status(InstanceStatus::TerminatingWait)
        .await
        .unwrap();

    // The draining worker records its own termination after the listing.
    let lifecycle = LifecycleClient::new(
        "gone-1",
        Some("workers".to_string()),
        Some("drain-hook".to_string()),
        h.instances.clone(),
        h.hooks.clone(),
        h.clock.clone(),
    );
    assert!(lifecycle.handle_scale_in().await.unwrap());

    h.clock.advance(Duration::from_secs(10));
    let metrics = metrics::init().unwrap();
    let reconciler = InstanceStateReconciler::new(
        Arc::new(SnapshotListing {
            inner: h.instances.clone(),
            snapshot,
        }),
        h.group.clone(),
        h.clock.clone(),
        WAIT,
        BackoffPolicy::deletion_poll(6, 1_000),
    )
    .with_metrics(metrics.clone());

    let zones = reconciler.manage_instances().await.expect("reconcile");
    assert_eq!(ids(&zones["zone-a"]), vec![a[0].as_str()]);

    let by_worker = h.record("gone-1").await.unwrap();
    assert_eq!(by_worker.status, InstanceStatus::Terminated);
    assert_eq!(by_worker.termination_time, Some(T0));
    let by_reconciler = h.record("gone-2").await.unwrap();
    assert_eq!(by_reconciler.status, InstanceStatus::Terminated);
    assert_eq!(by_reconciler.termination_time, Some(T0 + 10_000));

    let rendered = String::from_utf8(metrics::render(&metrics).unwrap()).unwrap();
    assert!(rendered.contains("aggwork_instances_terminated_total 1"));
}
