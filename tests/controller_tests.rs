
use std::time::Duration;

use aggwork::asg_instance::{InstanceStatus, TerminationReason};
use aggwork::fleet::controller::TickSummary;
use aggwork::fleet::FleetController;
use aggwork::settings::FleetSettings;
use test_helpers::*;

fn controller(h: &FleetHarness) -> FleetController {
    FleetController::from_settings(
        &FleetSettings::default(),
        h.instances.clone(),
        h.group.clone(),
        h.clock.clone(),
        None,
    )
}

#[aggwork::test]
async fn tick_replaces_outdated_then_scales_in_the_rest() {
    let h = FleetHarness::new();
    let a = h.add("a", &["i1", "i2"]).await;
    let b = h.add("b", &["j1"]).await;
    let old = instance("b", "j0", "worker-template-v1");
    h.group.add_instance(old.clone()).await;
    h.group.set_recommended_size(Some(2)).await;

    let summary = controller(&h).run_tick().await.unwrap();

    // The outdated instance leaves through the update pass, so scale-in only
    // has to remove one of the three current ones.
    assert_eq!(
        summary,
        TickSummary {
            active: 4,
            current: 3,
            scaled_in: vec![a[1].clone()],
        }
    );
    assert_eq!(
        h.record(&old.instance_id).await.unwrap().termination_reason,
        TerminationReason::Update
    );
    assert!(h.record(&a[0]).await.is_none());
    assert!(h.record(&b[0]).await.is_none());
}

#[aggwork::test]
async fn marked_instances_are_deleted_after_the_wait() {
    let h = FleetHarness::new();
    let a = h.add("a", &["i1", "i2", "i3"]).await;
    h.group.set_recommended_size(Some(2)).await;
    let controller = controller(&h);

    let first = controller.run_tick().await.unwrap();
    assert_eq!(first.scaled_in, vec![a[2].clone()]);

    // While waiting, the instance is neither counted nor selected again.
    h.clock.advance(Duration::from_secs(60));
    let second = controller.run_tick().await.unwrap();
    assert_eq!(second.active, 2);
    assert!(second.scaled_in.is_empty());
    assert!(h.group.delete_calls().await.is_empty());

    h.clock.set(T0 + WAIT.as_millis() as i64 + 1);
    let third = controller.run_tick().await.unwrap();
    assert_eq!(third.active, 2);
    assert_eq!(h.group.delete_calls().await, vec![vec![a[2].clone()]]);
    assert_eq!(h.group.instance_ids().await, a[..2].to_vec());
    assert_eq!(
        h.record(&a[2]).await.unwrap().status,
        InstanceStatus::Terminated
    );
}

#[aggwork::test(start_paused = true)]
async fn run_ticks_until_shutdown() {
    let h = FleetHarness::new();
    h.add("a", &["i1", "i2"]).await;
    h.group.set_recommended_size(Some(1)).await;
    let controller = controller(&h);
    let (tx, rx) = tokio::sync::watch::channel(false);

    let stopper = async {
        tokio::time::sleep(Duration::from_secs(90)).await;
        tx.send(true).expect("receiver alive");
    };
    tokio::join!(controller.run(rx), stopper);

    // Ticks at 0s and 60s; the second finds the instance already marked.
    assert_eq!(h.instances.all().await.len(), 1);
}
