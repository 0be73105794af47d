
use std::time::Duration;

use aggwork::asg_instance::InstanceStatus;
use aggwork::fleet::heartbeat::{HeartbeatConfig, HeartbeatOutcome};
use aggwork::fleet::{FleetError, LeaseHeartbeatService};
use aggwork::metrics;
use aggwork::settings::HeartbeatSettings;
use test_helpers::*;

const NAME: &str = "vm-1";

fn config() -> HeartbeatConfig {
    HeartbeatConfig {
        enabled: true,
        instance_name: NAME.to_string(),
        poll_interval: Duration::from_secs(1_800),
        failure_retry: Duration::from_secs(60),
        heartbeat_timeout: Some(Duration::from_secs(600)),
        max_extension: Some(Duration::from_secs(3_600)),
        scale_in_hook: Some("drain-hook".to_string()),
        autoscaling_group: Some("workers".to_string()),
        renewal_margin: Duration::from_secs(120),
    }
}

fn service(h: &FleetHarness, config: HeartbeatConfig) -> LeaseHeartbeatService {
    LeaseHeartbeatService::new(
        config,
        h.instances.clone(),
        h.hooks.clone(),
        h.clock.clone(),
    )
}

#[test]
fn config_from_settings_copies_hook_parameters() {
    let settings = HeartbeatSettings {
        enabled: true,
        heartbeat_timeout_secs: Some(600),
        max_extension_secs: Some(3_600),
        scale_in_hook: Some("drain-hook".to_string()),
        autoscaling_group: Some("workers".to_string()),
        ..HeartbeatSettings::default()
    };
    let cfg = HeartbeatConfig::from_settings(&settings, NAME.to_string());
    assert_eq!(cfg.heartbeat_timeout, Some(Duration::from_secs(600)));
    assert_eq!(cfg.renewal_margin, Duration::from_secs(120));
    assert_eq!(cfg.poll_interval, Duration::from_secs(1_800));
    assert_eq!(cfg.instance_name, NAME);
}

#[aggwork::test]
async fn disabled_or_unconfigured_service_does_nothing() {
    let h = FleetHarness::new();
    h.mark_waiting(NAME, T0).await;

    let disabled = HeartbeatConfig {
        enabled: false,
        ..config()
    };
    assert_eq!(
        service(&h, disabled).tick().await.unwrap(),
        HeartbeatOutcome::Disabled
    );

    let no_timeout = HeartbeatConfig {
        heartbeat_timeout: None,
        ..config()
    };
    assert_eq!(
        service(&h, no_timeout).tick().await.unwrap(),
        HeartbeatOutcome::Unconfigured
    );

    let empty_hook = HeartbeatConfig {
        scale_in_hook: Some(String::new()),
        ..config()
    };
    assert_eq!(
        service(&h, empty_hook).tick().await.unwrap(),
        HeartbeatOutcome::Unconfigured
    );
    assert!(h.hooks.heartbeats().await.is_empty());
}

#[aggwork::test]
async fn no_record_means_no_heartbeat() {
    let h = FleetHarness::new();
    assert_eq!(
        service(&h, config()).tick().await.unwrap(),
        HeartbeatOutcome::NoRecord
    );
}

#[aggwork::test]
async fn heartbeat_sent_once_renewal_window_opens() {
    let h = FleetHarness::new();
    let metrics = metrics::init().unwrap();
    h.mark_waiting(NAME, T0).await;
    let svc = service(&h, config()).with_metrics(metrics.clone());

    h.clock.advance(Duration::from_secs(60));
    let outcome = svc.tick().await.unwrap();
    assert_eq!(
        outcome,
        HeartbeatOutcome::NotDue {
            next_window_ms: Some(T0 + 480_000)
        }
    );
    assert_eq!(svc.sleep_after(&outcome), Duration::from_secs(420));

    h.clock.set(T0 + 480_000);
    assert_eq!(
        svc.tick().await.unwrap(),
        HeartbeatOutcome::Sent {
            at_ms: T0 + 480_000
        }
    );
    let calls = h.hooks.heartbeats().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].group, "workers");
    assert_eq!(calls[0].instance_id, NAME);
    assert_eq!(calls[0].hook, "drain-hook");
    let record = h.record(NAME).await.unwrap();
    assert_eq!(record.last_heartbeat_time, Some(T0 + 480_000));
    assert_eq!(record.status, InstanceStatus::TerminatingWait);

    // Next window is measured from the heartbeat just sent.
    h.clock.advance(Duration::from_secs(1));
    assert_eq!(
        svc.tick().await.unwrap(),
        HeartbeatOutcome::NotDue {
            next_window_ms: Some(T0 + 960_000)
        }
    );

    let rendered = String::from_utf8(metrics::render(&metrics).unwrap()).unwrap();
    assert!(rendered.contains("aggwork_lifecycle_heartbeats_total{result=\"sent\"} 1"));
}

#[aggwork::test]
async fn heartbeats_stop_at_maximum_extension() {
    let h = FleetHarness::new();
    h.mark_waiting(NAME, T0).await;
    let svc = service(&h, config());

    let mut sent = 0;
    for minute in 0..=90 {
        h.clock.set(T0 + minute * 60_000);
        if let HeartbeatOutcome::Sent { .. } = svc.tick().await.unwrap() {
            sent += 1;
        }
    }
    // A window opens every eight minutes from minute 8. After minute 56 the
    // next heartbeat would outlast the one hour budget.
    assert_eq!(sent, 7);
    let last = h.record(NAME).await.unwrap().last_heartbeat_time;
    assert_eq!(last, Some(T0 + 56 * 60_000));
}

#[aggwork::test]
async fn failed_heartbeat_leaves_record_untouched() {
    let h = FleetHarness::new();
    h.mark_waiting(NAME, T0).await;
    h.hooks.set_fail_heartbeats(true).await;
    h.clock.set(T0 + 500_000);

    let err = service(&h, config()).tick().await.unwrap_err();
    assert!(matches!(err, FleetError::Cloud(_)));
    assert_eq!(h.record(NAME).await.unwrap().last_heartbeat_time, None);
}

#[aggwork::test(start_paused = true)]
async fn run_stops_on_shutdown() {
    let h = FleetHarness::new();
    h.mark_waiting(NAME, T0).await;
    let svc = service(&h, config());
    let (tx, rx) = tokio::sync::watch::channel(false);

    let stopper = async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        tx.send(true).expect("receiver alive");
    };
    tokio::join!(svc.run(rx), stopper);
    assert!(h.hooks.heartbeats().await.is_empty());
}
