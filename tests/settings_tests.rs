use std::io::Write;
use std::time::Duration;

use aggwork::job_client::JobClientConfig;
use aggwork::settings::{AppConfig, Backend, LogFormat};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[aggwork::test]
fn defaults_without_a_file() {
    let cfg = AppConfig::load(None).unwrap();
    assert_eq!(cfg.logging.format, LogFormat::Text);
    assert_eq!(cfg.store.backend, Backend::Memory);
    assert!(cfg.metrics.addr.is_none());
    assert_eq!(cfg.job_client.max_attempts, 5);
    assert_eq!(cfg.job_client.max_retry_delay_secs, 600);
    assert_eq!(cfg.fleet.termination_wait_timeout(), Duration::from_secs(3_600));
    assert_eq!(cfg.fleet.delete_poll_max_retries, 6);
    assert!(!cfg.heartbeat.enabled);
    assert_eq!(cfg.heartbeat.renewal_margin_secs, 120);
}

#[aggwork::test]
fn partial_file_keeps_other_defaults() {
    let file = write_config(
        r#"
[logging]
format = "json"

[store]
backend = "fs"
path = "/var/lib/aggwork"

[job_client]
max_attempts = 3

[heartbeat]
enabled = true
heartbeat_timeout_secs = 600
max_extension_secs = 3600
scale_in_hook = "drain"
autoscaling_group = "workers"
instance_name = "vm-7"
"#,
    );
    let cfg = AppConfig::load(Some(file.path())).unwrap();
    assert_eq!(cfg.logging.format, LogFormat::Json);
    assert_eq!(cfg.store.backend, Backend::Fs);
    assert_eq!(cfg.store.path, "/var/lib/aggwork");
    assert_eq!(cfg.job_client.max_attempts, 3);
    assert_eq!(cfg.job_client.pull_max_attempts, 10);
    assert_eq!(cfg.fleet.tick_interval(), Duration::from_secs(60));
    assert_eq!(cfg.heartbeat.resolve_instance_name().unwrap(), "vm-7");
    assert_eq!(cfg.heartbeat.poll_interval_secs, 1_800);

    let client = JobClientConfig::from(&cfg.job_client);
    assert_eq!(client.max_attempts, 3);
    assert_eq!(client.pull_backoff.max_attempts, 10);
    assert_eq!(client.max_retry_delay, Duration::from_secs(600));
}

#[aggwork::test]
fn invalid_values_are_rejected() {
    for contents in [
        "[job_client]\nmax_attempts = 0\n",
        "[job_client]\npull_max_attempts = 0\n",
        "[job_client]\npull_backoff_factor = 0.5\n",
        "[fleet]\ntick_interval_secs = 0\n",
        "[metrics]\naddr = \"not an address\"\n",
    ] {
        let file = write_config(contents);
        assert!(
            AppConfig::load(Some(file.path())).is_err(),
            "accepted invalid config: {contents}"
        );
    }
}

#[aggwork::test]
fn unknown_backend_fails_to_parse() {
    let file = write_config("[store]\nbackend = \"tape\"\n");
    assert!(AppConfig::load(Some(file.path())).is_err());
}

#[aggwork::test]
fn missing_file_is_an_error() {
    assert!(AppConfig::load(Some(std::path::Path::new("/nonexistent/aggwork.toml"))).is_err());
}
