use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub job_client: JobClientSettings,
    #[serde(default)]
    pub fleet: FleetSettings,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    /// Address for the `/metrics` endpoint, e.g. 127.0.0.1:9464. No server when unset.
    pub addr: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,
    #[serde(default = "default_store_path")]
    pub path: String,
    /// SlateDB flush interval; SlateDB's own default when unset.
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
            flush_interval_ms: None,
        }
    }
}

fn default_backend() -> Backend {
    Backend::Memory
}

fn default_store_path() -> String {
    "aggwork".to_string()
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Fs,
    S3,
    Gcs,
    Memory,
    Url,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct JobClientSettings {
    pub max_attempts: u32,
    pub pull_max_attempts: u32,
    pub pull_initial_backoff_ms: i64,
    pub pull_max_backoff_ms: i64,
    pub pull_backoff_factor: f64,
    pub max_retry_delay_secs: u64,
    pub extender_interval_secs: u64,
    pub extension_secs: u64,
}

impl Default for JobClientSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            pull_max_attempts: 10,
            pull_initial_backoff_ms: 1_000,
            pull_max_backoff_ms: 30_000,
            pull_backoff_factor: 2.0,
            max_retry_delay_secs: 600,
            extender_interval_secs: 60,
            extension_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FleetSettings {
    pub termination_wait_timeout_secs: u64,
    pub asg_instance_ttl_days: u32,
    pub tick_interval_secs: u64,
    pub delete_poll_max_retries: u32,
    pub delete_poll_base_ms: i64,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            termination_wait_timeout_secs: 3_600,
            asg_instance_ttl_days: 365,
            tick_interval_secs: 60,
            delete_poll_max_retries: 6,
            delete_poll_base_ms: 1_000,
        }
    }
}

impl FleetSettings {
    pub fn termination_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.termination_wait_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub failure_retry_secs: u64,
    pub heartbeat_timeout_secs: Option<u64>,
    pub max_extension_secs: Option<u64>,
    pub scale_in_hook: Option<String>,
    pub autoscaling_group: Option<String>,
    pub renewal_margin_secs: u64,
    /// Identity of this instance in the instance store; the host name when unset.
    pub instance_name: Option<String>,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_secs: 1_800,
            failure_retry_secs: 60,
            heartbeat_timeout_secs: None,
            max_extension_secs: None,
            scale_in_hook: None,
            autoscaling_group: None,
            renewal_margin_secs: 120,
            instance_name: None,
        }
    }
}

impl HeartbeatSettings {
    /// The configured instance name, falling back to the local host name.
    pub fn resolve_instance_name(&self) -> anyhow::Result<String> {
        if let Some(name) = &self.instance_name {
            return Ok(name.clone());
        }
        let host = hostname::get()?;
        Ok(host.to_string_lossy().into_owned())
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                cfg.validate()?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }

    /// Reject values that would make the pull loop or the fleet passes meaningless.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.job_client.max_attempts == 0 {
            anyhow::bail!("job_client.max_attempts must be at least 1");
        }
        if self.job_client.pull_max_attempts == 0 {
            anyhow::bail!("job_client.pull_max_attempts must be at least 1");
        }
        if self.job_client.pull_backoff_factor < 1.0 {
            anyhow::bail!("job_client.pull_backoff_factor must be >= 1.0");
        }
        if self.fleet.tick_interval_secs == 0 {
            anyhow::bail!("fleet.tick_interval_secs must be positive");
        }
        if let Some(addr) = &self.metrics.addr {
            addr.parse::<std::net::SocketAddr>()
                .map_err(|e| anyhow::anyhow!("invalid metrics.addr {addr}: {e}"))?;
        }
        Ok(())
    }
}
