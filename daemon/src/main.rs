use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use alpenhorn_daemon::config::{self, Config};
use alpenhorn_daemon::error::DaemonError;
use alpenhorn_daemon::extensions::Registry;
use alpenhorn_daemon::pool::WorkerPool;
use alpenhorn_daemon::{check_schema, metrics, update, StateInner};

/// Exit codes, part of the daemon's contract with its supervisor.
const EXIT_CONFIG: i32 = 1;
const EXIT_DATABASE: i32 = 2;
const EXIT_EXTENSION: i32 = 3;
const EXIT_SCHEMA: i32 = 4;

/// Archive management daemon.
#[derive(Debug, Parser)]
#[clap(version)]
#[clap(name = "alpenhornd")]
struct Opts {
    /// Path to the config file.
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,

    /// Run the update loop once, wait for updates to complete, and then
    /// exit.
    #[clap(short = 'o', long, alias = "exit-after-update")]
    once: bool,

    /// Check the configuration then exit.
    #[clap(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() {
    let opts = Opts::parse();

    let config = match config::load_config(opts.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error reading configuration: {e}");
            exit(EXIT_CONFIG);
        }
    };

    init_logging(&config);
    dump_version();

    if opts.check_config {
        // Config is valid, let's just exit :)
        return;
    }

    let registry = match Registry::load(&config) {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!("Failed to load extensions: {}", e);
            exit(EXIT_EXTENSION);
        }
    };

    let shutdown = CancellationToken::new();
    let state = StateInner::new(config, registry, shutdown.clone());

    // The Index must be reachable and speak our schema before anything
    // else starts
    let db = match state.database().await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Data Index unreachable: {}", e);
            exit(EXIT_DATABASE);
        }
    };
    match check_schema(db).await {
        Ok(()) => {}
        Err(e @ DaemonError::SchemaVersionMismatch { .. }) => {
            tracing::error!("{}", e);
            exit(EXIT_SCHEMA);
        }
        Err(e) => {
            tracing::error!("Data Index unreachable: {}", e);
            exit(EXIT_DATABASE);
        }
    }

    if let Some(listen) = state.config.metrics.listen {
        let metrics = state.metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::run_metrics_server(listen, metrics).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        });
    }

    let pool = WorkerPool::start(state.config.daemon.workers, state.queue.clone());
    tracing::info!(
        "Started {} workers on host \"{}\".",
        pool.len(),
        state.hostname
    );

    // A terminating signal stops new work and starts the graceful drain
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Received terminating signal, shutting down.");
        signal_shutdown.cancel();
    });

    let code = update::update_loop(state.clone(), opts.once).await;

    shutdown.cancel();
    pool.shutdown(state.config.daemon.shutdown_grace).await;

    tracing::info!("Shutdown complete.");
    exit(code);
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_logging(config: &Config) {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.logging.level))
        .init();
}

fn dump_version() {
    #[cfg(debug_assertions)]
    eprintln!("Alpenhorn Daemon {} (debug)", env!("CARGO_PKG_VERSION"));

    #[cfg(not(debug_assertions))]
    eprintln!("Alpenhorn Daemon {} (release)", env!("CARGO_PKG_VERSION"));
}
