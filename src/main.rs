use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, watch};
use tracing::info;
use uuid::Uuid;

use aggwork::clock::{Clock, SystemClock};
use aggwork::cloud::{ComputeInstance, RecordingLifecycleHooks, SimulatedInstanceGroup};
use aggwork::factory::Stores;
use aggwork::fleet::{FleetController, WorkerLifecycle};
use aggwork::job::{JobKey, JobMetadata, RequestInfo};
use aggwork::job_client::extender::run_processing_extender;
use aggwork::job_client::{JobClient, JobClientConfig};
use aggwork::metrics::{self, Metrics};
use aggwork::queue::{InMemoryJobQueue, JobQueue};
use aggwork::settings::{AppConfig, LogFormat};
use aggwork::store::JobMetadataStore;
use aggwork::trace;
use aggwork::worker::{PassThroughProcessor, WorkerPullService, WorkerStats};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// override the configured log format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enqueue jobs on an in-memory queue and drain them with local workers
    Local {
        #[arg(long, default_value = "10")]
        jobs: u32,
        #[arg(long, default_value = "2")]
        workers: u32,
        #[arg(long, default_value = "300")]
        processing_timeout_secs: u64,
        /// Pull attempts per get_job call before a worker gives up
        #[arg(long, default_value = "1")]
        pull_attempts: u32,
    },
    /// Run fleet controller ticks against a simulated instance group
    FleetSim {
        /// Comma-separated zone names
        #[arg(long, default_value = "zone-a,zone-b")]
        zones: String,
        #[arg(long, default_value = "3")]
        per_zone: usize,
        #[arg(long, default_value = "4")]
        recommended: usize,
        #[arg(long, default_value = "1")]
        ticks: u32,
    },
    /// Validate the configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = AppConfig::load(args.config.as_deref())?;
    trace::init(args.log_format.unwrap_or(cfg.logging.format))?;

    let metrics = metrics::init()?;
    let (metrics_shutdown, _) = broadcast::channel(1);
    let metrics_task = match &cfg.metrics.addr {
        Some(addr) => {
            let addr: SocketAddr = addr.parse()?;
            Some(tokio::spawn(metrics::run_metrics_server(
                addr,
                metrics.clone(),
                metrics_shutdown.subscribe(),
            )))
        }
        None => None,
    };

    let result = match args.command {
        Command::Local {
            jobs,
            workers,
            processing_timeout_secs,
            pull_attempts,
        } => {
            run_local(
                &cfg,
                metrics,
                jobs,
                workers,
                Duration::from_secs(processing_timeout_secs),
                pull_attempts,
            )
            .await
        }
        Command::FleetSim {
            zones,
            per_zone,
            recommended,
            ticks,
        } => run_fleet_sim(&cfg, metrics, &zones, per_zone, recommended, ticks).await,
        Command::CheckConfig => {
            info!(config = ?cfg, "configuration is valid");
            Ok(())
        }
    };

    let _ = metrics_shutdown.send(());
    if let Some(task) = metrics_task {
        task.await??;
    }
    result
}

async fn run_local(
    cfg: &AppConfig,
    metrics: Metrics,
    jobs: u32,
    workers: u32,
    processing_timeout: Duration,
    pull_attempts: u32,
) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let stores = Stores::open(&cfg.store, Arc::clone(&clock)).await?;
    let queue = InMemoryJobQueue::new_arc(Arc::clone(&clock));

    for n in 0..jobs {
        let key = JobKey::new(format!("local-{n}"));
        let server_job_id = Uuid::new_v4().to_string();
        let request_info = RequestInfo {
            job_request_id: key.to_string(),
            ..RequestInfo::default()
        };
        stores
            .metadata
            .insert(JobMetadata::received(
                key.clone(),
                server_job_id.clone(),
                request_info,
                clock.now_ms(),
                7,
            ))
            .await?;
        queue.send(&key, &server_job_id, processing_timeout).await?;
    }
    info!(jobs, workers, "enqueued local jobs");

    let mut config = JobClientConfig::from(&cfg.job_client);
    config.pull_backoff.max_attempts = pull_attempts.max(1);
    let mut client = JobClient::new(
        queue.clone(),
        Arc::clone(&stores.metadata),
        Arc::clone(&clock),
        config,
    )
    .with_metrics(metrics.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut heartbeat = None;
    if let Some(lifecycle) = WorkerLifecycle::from_settings(
        &cfg.heartbeat,
        Arc::clone(&stores.instances),
        RecordingLifecycleHooks::new_arc(),
        Arc::clone(&clock),
        Some(metrics.clone()),
    )? {
        client = client.with_lifecycle(lifecycle.client);
        let service = lifecycle.heartbeat;
        let shutdown = shutdown_rx.clone();
        heartbeat = Some(tokio::spawn(async move { service.run(shutdown).await }));
    }

    let client = Arc::new(client);
    let extender = tokio::spawn(run_processing_extender(
        Arc::clone(&client),
        shutdown_rx.clone(),
    ));

    let processor = Arc::new(PassThroughProcessor::new(Arc::clone(&clock)));
    let mut handles = Vec::new();
    for _ in 0..workers.max(1) {
        let service = WorkerPullService::new(Arc::clone(&client), processor.clone())
            .with_metrics(metrics.clone());
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { service.run(shutdown).await }));
    }

    let mut total = WorkerStats::default();
    for handle in handles {
        let stats = handle.await??;
        total.completed += stats.completed;
        total.retried += stats.retried;
        total.failed += stats.failed;
        total.conflicts += stats.conflicts;
    }
    let _ = shutdown_tx.send(true);
    extender.await?;
    if let Some(heartbeat) = heartbeat {
        heartbeat.await?;
    }
    stores.close().await?;

    info!(
        completed = total.completed,
        retried = total.retried,
        failed = total.failed,
        conflicts = total.conflicts,
        remaining = queue.len().await,
        "local run finished"
    );
    Ok(())
}

async fn run_fleet_sim(
    cfg: &AppConfig,
    metrics: Metrics,
    zones: &str,
    per_zone: usize,
    recommended: usize,
    ticks: u32,
) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let stores = Stores::open(&cfg.store, Arc::clone(&clock)).await?;
    let group = SimulatedInstanceGroup::new_arc("worker-template-v1");
    for zone in zones.split(',').map(str::trim).filter(|z| !z.is_empty()) {
        for n in 0..per_zone {
            group
                .add_instance(ComputeInstance::new(
                    format!("projects/local/zones/{zone}/instances/worker-{zone}-{n}"),
                    "worker-template-v1",
                ))
                .await;
        }
    }
    group.set_recommended_size(Some(recommended)).await;

    let controller = FleetController::from_settings(
        &cfg.fleet,
        Arc::clone(&stores.instances),
        group.clone(),
        clock,
        Some(metrics),
    );
    for tick in 0..ticks {
        let summary = controller.run_tick().await?;
        info!(
            tick,
            active = summary.active,
            scaled_in = ?summary.scaled_in,
            "fleet tick"
        );
    }
    stores.close().await?;
    Ok(())
}
