//! Daemon metrics.
//!
//! A small fixed set of counters and gauges, exposed on an optional
//! `/metrics` listener. The metric names are part of the observability
//! layer, not of the daemon's contract.

use std::net::SocketAddr;

use anyhow::Result;
use axum::{extract::Extension, routing::get, Router};
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    /// Completed main loops.
    pub main_loops: IntCounter,

    /// Wall time of the last main loop pass.
    pub main_loop_seconds: Gauge,

    pub tasks_queued: IntGauge,
    pub tasks_deferred: IntGauge,
    pub tasks_in_progress: IntGauge,

    /// Import attempts, labelled by result.
    pub imports: IntCounterVec,

    /// Pull attempts, labelled by result.
    pub pulls: IntCounterVec,

    /// Verification checks, labelled by result.
    pub verifications: IntCounterVec,

    pub deleted_files: IntCounter,
    pub deleted_bytes: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let main_loops =
            IntCounter::with_opts(Opts::new("alpenhornd_main_loops_total", "Completed main loops"))
                .unwrap();
        let main_loop_seconds = Gauge::with_opts(Opts::new(
            "alpenhornd_main_loop_seconds",
            "Main loop execution time",
        ))
        .unwrap();
        let tasks_queued =
            IntGauge::with_opts(Opts::new("alpenhornd_tasks_queued", "Tasks ready to run"))
                .unwrap();
        let tasks_deferred =
            IntGauge::with_opts(Opts::new("alpenhornd_tasks_deferred", "Tasks waiting on a timer"))
                .unwrap();
        let tasks_in_progress = IntGauge::with_opts(Opts::new(
            "alpenhornd_tasks_in_progress",
            "Tasks being run by workers",
        ))
        .unwrap();
        let imports = IntCounterVec::new(
            Opts::new("alpenhornd_imports_total", "Import attempts"),
            &["result"],
        )
        .unwrap();
        let pulls = IntCounterVec::new(
            Opts::new("alpenhornd_pulls_total", "Pull attempts"),
            &["result"],
        )
        .unwrap();
        let verifications = IntCounterVec::new(
            Opts::new("alpenhornd_verifications_total", "Verification checks"),
            &["result"],
        )
        .unwrap();
        let deleted_files =
            IntCounter::with_opts(Opts::new("alpenhornd_deleted_files_total", "Deleted copies"))
                .unwrap();
        let deleted_bytes = IntCounter::with_opts(Opts::new(
            "alpenhornd_deleted_bytes_total",
            "Bytes freed by deletion",
        ))
        .unwrap();

        for collector in [
            Box::new(main_loops.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(main_loop_seconds.clone()),
            Box::new(tasks_queued.clone()),
            Box::new(tasks_deferred.clone()),
            Box::new(tasks_in_progress.clone()),
            Box::new(imports.clone()),
            Box::new(pulls.clone()),
            Box::new(verifications.clone()),
            Box::new(deleted_files.clone()),
            Box::new(deleted_bytes.clone()),
        ] {
            registry.register(collector).unwrap();
        }

        Self {
            registry,
            main_loops,
            main_loop_seconds,
            tasks_queued,
            tasks_deferred,
            tasks_in_progress,
            imports,
            pulls,
            verifications,
            deleted_files,
            deleted_bytes,
        }
    }

    /// Renders the registry in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }

        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

async fn metrics_handler(Extension(metrics): Extension<Metrics>) -> String {
    metrics.render()
}

/// Serves `/metrics` until the process exits.
pub async fn run_metrics_server(listen: SocketAddr, metrics: Metrics) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .layer(Extension(metrics));

    tracing::info!("Serving metrics on {:?}", listen);
    axum::Server::bind(&listen).serve(app.into_make_service()).await?;

    Ok(())
}
