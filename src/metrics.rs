//! Prometheus metrics.
//!
//! Create one [`Metrics`] handle at startup with [`init`], hand clones to the
//! components that record, and serve it with [`run_metrics_server`]:
//! ```ignore
//! let metrics = aggwork::metrics::init()?;
//! tokio::spawn(aggwork::metrics::run_metrics_server(addr, metrics.clone(), shutdown_rx));
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{core::Collector, Counter, CounterVec, Encoder, Opts, Registry, TextEncoder};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Job client
    job_pulls: CounterVec,
    job_transitions: CounterVec,
    queue_messages_dropped: CounterVec,
    job_client_errors: CounterVec,
    jobs_processed: CounterVec,

    // Fleet
    instances_marked: CounterVec,
    instances_terminated: Counter,
    instance_deletions: Counter,
    heartbeats: CounterVec,
}

impl Metrics {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// One iteration of the pull loop, labelled by what it found.
    pub fn record_job_pull(&self, outcome: &str) {
        self.job_pulls.with_label_values(&[outcome]).inc();
    }

    pub fn record_job_transition(&self, from: &str, to: &str) {
        self.job_transitions.with_label_values(&[from, to]).inc();
    }

    pub fn record_queue_message_dropped(&self, reason: &str) {
        self.queue_messages_dropped
            .with_label_values(&[reason])
            .inc();
    }

    pub fn record_job_client_error(&self, reason: &str) {
        self.job_client_errors.with_label_values(&[reason]).inc();
    }

    pub fn record_job_processed(&self, outcome: &str) {
        self.jobs_processed.with_label_values(&[outcome]).inc();
    }

    pub fn record_instance_marked(&self, reason: &str) {
        self.instances_marked.with_label_values(&[reason]).inc();
    }

    pub fn record_instance_terminated(&self) {
        self.instances_terminated.inc();
    }

    pub fn record_instance_deletions(&self, count: usize) {
        self.instance_deletions.inc_by(count as f64);
    }

    pub fn record_heartbeat(&self, result: &str) {
        self.heartbeats.with_label_values(&[result]).inc();
    }
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        warn!(error = %e, "failed to register metric");
    }
    metric
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> anyhow::Result<CounterVec> {
    Ok(register(
        registry,
        CounterVec::new(Opts::new(name, help), labels)?,
    ))
}

/// Build a fresh registry with every instrument registered.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let job_pulls = counter_vec(
        &registry,
        "aggwork_job_pulls_total",
        "Pull loop iterations by outcome",
        &["outcome"],
    )?;
    let job_transitions = counter_vec(
        &registry,
        "aggwork_job_transitions_total",
        "Job metadata status transitions",
        &["from", "to"],
    )?;
    let queue_messages_dropped = counter_vec(
        &registry,
        "aggwork_queue_messages_dropped_total",
        "Queue messages acknowledged without being processed",
        &["reason"],
    )?;
    let job_client_errors = counter_vec(
        &registry,
        "aggwork_job_client_errors_total",
        "Job client operation failures by error reason",
        &["reason"],
    )?;
    let jobs_processed = counter_vec(
        &registry,
        "aggwork_jobs_processed_total",
        "Jobs handled by the worker pull loop by outcome",
        &["outcome"],
    )?;
    let instances_marked = counter_vec(
        &registry,
        "aggwork_instances_marked_total",
        "Instances moved to TERMINATING_WAIT by reason",
        &["reason"],
    )?;
    let instances_terminated = register(
        &registry,
        Counter::new(
            "aggwork_instances_terminated_total",
            "Instance records moved to TERMINATED",
        )?,
    );
    let instance_deletions = register(
        &registry,
        Counter::new(
            "aggwork_instance_deletions_total",
            "Instances passed to the instance group for deletion",
        )?,
    );
    let heartbeats = counter_vec(
        &registry,
        "aggwork_lifecycle_heartbeats_total",
        "Lifecycle hook heartbeats by result",
        &["result"],
    )?;

    Ok(Metrics {
        registry: Arc::new(registry),
        job_pulls,
        job_transitions,
        queue_messages_dropped,
        job_client_errors,
        jobs_processed,
        instances_marked,
        instances_terminated,
        instance_deletions,
        heartbeats,
    })
}

/// Render the registry in the Prometheus text format.
pub fn render(metrics: &Metrics) -> Result<Vec<u8>, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&metrics.registry.gather(), &mut buffer)?;
    Ok(buffer)
}

async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    match render(&metrics) {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("failed to encode metrics: {e}").into_bytes(),
            )
        }
    }
}

/// Router exposing `GET /metrics`.
pub fn router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Serve `/metrics` on `addr` until `shutdown` fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = router(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "metrics server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            debug!("metrics server shutting down");
        })
        .await?;
    Ok(())
}
