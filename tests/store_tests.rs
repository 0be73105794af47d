
use std::sync::Arc;
use std::time::Duration;

use aggwork::asg_instance::{AsgInstance, InstanceStatus, TerminationReason};
use aggwork::clock::{Clock, ManualClock};
use aggwork::factory::Stores;
use aggwork::job::{JobKey, JobStatus};
use aggwork::settings::{Backend, StoreConfig};
use aggwork::store::{
    next_update_marker, AsgInstanceStore, InMemoryAsgInstanceStore, InMemoryJobMetadataStore,
    JobMetadataStore, SlateStore, StoreError,
};
use test_helpers::*;

fn memory_config() -> StoreConfig {
    StoreConfig {
        backend: Backend::Memory,
        path: "aggwork-test".to_string(),
        flush_interval_ms: Some(10),
    }
}

fn fs_config(tmp: &tempfile::TempDir) -> StoreConfig {
    StoreConfig {
        backend: Backend::Fs,
        path: tmp.path().join("db").to_string_lossy().to_string(),
        flush_interval_ms: Some(10),
    }
}

async fn exercise_job_cas(store: Arc<dyn JobMetadataStore>, clock: &ManualClock) {
    let original = received_metadata("job-1", clock.now_ms());
    store.insert(original.clone()).await.expect("insert");

    let err = store.insert(original.clone()).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(_)));

    let mut claim = original.clone();
    claim.status = JobStatus::InProgress;
    let stored = store.update(claim).await.expect("first update");
    assert_eq!(stored.status, JobStatus::InProgress);
    assert!(stored.request_updated_at > original.request_updated_at);

    // A writer still holding the original record loses.
    let mut stale = original.clone();
    stale.status = JobStatus::Finished;
    let err = store.update(stale).await.unwrap_err();
    assert!(err.is_conflict(), "unexpected error: {err:?}");

    let current = store.get(&JobKey::from("job-1")).await.unwrap().unwrap();
    assert_eq!(current, stored);

    let mut fewer = current.clone();
    fewer.num_attempts = 0;
    let mut more = current.clone();
    more.num_attempts = 2;
    let bumped = store.update(more).await.expect("attempts increase");
    fewer.request_updated_at = bumped.request_updated_at;
    assert!(store.update(fewer).await.unwrap_err().is_conflict());

    let mut missing = received_metadata("job-2", clock.now_ms());
    missing.status = JobStatus::InProgress;
    assert!(matches!(
        store.update(missing).await.unwrap_err(),
        StoreError::NotFound(_)
    ));
}

async fn exercise_instance_records(store: Arc<dyn AsgInstanceStore>) {
    let first = AsgInstance::terminating_wait("vm-a", TerminationReason::ScaleIn, T0, 365);
    store.upsert(first.clone()).await.unwrap();

    // Re-marking keeps the original request time.
    let again =
        AsgInstance::terminating_wait("vm-a", TerminationReason::Update, T0 + 60_000, 365);
    store.upsert(again).await.unwrap();
    let current = store.get("vm-a").await.unwrap().unwrap();
    assert_eq!(current.request_time, T0);
    assert_eq!(current.termination_reason, TerminationReason::Update);

    store
        .upsert(AsgInstance::terminating_wait(
            "vm-b",
            TerminationReason::ScaleIn,
            T0,
            365,
        ))
        .await
        .unwrap();

    let mut heartbeat = current.clone();
    heartbeat.last_heartbeat_time = Some(T0 + 1_000);
    store.update(heartbeat).await.unwrap();

    let mut moved = current.clone();
    moved.request_time = T0 + 5;
    assert!(store.update(moved).await.unwrap_err().is_conflict());

    let mut done = store.get("vm-a").await.unwrap().unwrap();
    done.status = InstanceStatus::Terminated;
    done.termination_time = Some(T0 + 2_000);
    store.update(done.clone()).await.unwrap();

    // TERMINATED is final for both write paths.
    let mut revived = done.clone();
    revived.status = InstanceStatus::TerminatingWait;
    assert!(store.update(revived.clone()).await.unwrap_err().is_conflict());
    assert!(store.upsert(revived).await.unwrap_err().is_conflict());
    assert_eq!(store.get("vm-a").await.unwrap().unwrap(), done);

    let ghost = AsgInstance::terminating_wait("vm-ghost", TerminationReason::ScaleIn, T0, 365);
    assert!(store.update(ghost).await.unwrap_err().is_conflict());

    let waiting = store
        .list_by_status(InstanceStatus::TerminatingWait)
        .await
        .unwrap();
    assert_eq!(
        waiting
            .iter()
            .map(|i| i.instance_name.as_str())
            .collect::<Vec<_>>(),
        vec!["vm-b"]
    );
    let terminated = store
        .list_by_status(InstanceStatus::Terminated)
        .await
        .unwrap();
    assert_eq!(terminated, vec![done]);
}

#[test]
fn update_marker_is_strictly_increasing() {
    assert_eq!(next_update_marker(100, 500), 500);
    assert_eq!(next_update_marker(500, 500), 501);
    assert_eq!(next_update_marker(900, 500), 901);
}

#[aggwork::test]
async fn memory_job_store_is_compare_and_swap() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = InMemoryJobMetadataStore::new_arc(clock.clone());
    exercise_job_cas(store.clone(), &clock).await;
    assert_eq!(store.updates_for(&JobKey::from("job-1")).await.len(), 2);
}

#[aggwork::test]
async fn memory_marker_advances_with_clock() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = InMemoryJobMetadataStore::new_arc(clock.clone());
    let original = received_metadata("job-1", T0);
    store.insert(original.clone()).await.unwrap();

    clock.advance(Duration::from_secs(10));
    let stored = store.update(original).await.unwrap();
    assert_eq!(stored.request_updated_at, T0 + 10_000);
}

#[aggwork::test]
async fn memory_instance_store_rules() {
    exercise_instance_records(InMemoryAsgInstanceStore::new_arc()).await;
}

#[aggwork::test]
async fn failing_upserts_surface_as_unavailable() {
    let store = InMemoryAsgInstanceStore::new_arc();
    store.fail_upserts_for("vm-a").await;
    let err = store
        .upsert(AsgInstance::terminating_wait(
            "vm-a",
            TerminationReason::ScaleIn,
            T0,
            365,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Unavailable(_)));
    assert!(store.all().await.is_empty());
}

#[aggwork::test]
async fn slate_memory_store_job_rules() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = SlateStore::open(&memory_config(), clock.clone())
        .await
        .expect("open");
    exercise_job_cas(store.clone(), &clock).await;
    store.close().await.unwrap();
}

#[aggwork::test]
async fn slate_memory_store_instance_rules() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = SlateStore::open(&memory_config(), clock)
        .await
        .expect("open");
    exercise_instance_records(store.clone()).await;
    store.close().await.unwrap();
}

#[aggwork::test]
async fn fs_store_survives_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(T0));

    let stores = Stores::open(&fs_config(&tmp), clock.clone())
        .await
        .expect("open");
    stores
        .metadata
        .insert(received_metadata("job-1", T0))
        .await
        .unwrap();
    stores
        .instances
        .upsert(AsgInstance::terminating_wait(
            "vm-a",
            TerminationReason::ScaleIn,
            T0,
            365,
        ))
        .await
        .unwrap();
    stores.close().await.unwrap();

    let reopened = Stores::open(&fs_config(&tmp), clock).await.expect("reopen");
    let job = reopened
        .metadata
        .get(&JobKey::from("job-1"))
        .await
        .unwrap()
        .expect("job persisted");
    assert_eq!(job.status, JobStatus::Received);
    let instance = reopened
        .instances
        .get("vm-a")
        .await
        .unwrap()
        .expect("instance persisted");
    assert_eq!(instance.request_time, T0);
    reopened.close().await.unwrap();
}
