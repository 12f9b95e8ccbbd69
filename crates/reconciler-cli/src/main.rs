//! `reconciler` daemon binary: loads configuration, wires the store,
//! driver registry, reconciler, dispatcher, and server together, and runs
//! the server loop until signalled to stop (§6.4).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::{error, info};

use reconciler::config::{LoggingTarget, MergeStrategyKind, ReconcilerConfig};
use reconciler::dispatcher::Dispatcher;
use reconciler::driver::DriverRegistry;
use reconciler::reconciler::Reconciler;
use reconciler::server::Server;
use reconciler::store::InMemoryStore;
use reconciler::telemetry;
use reconciler_core::merge::{MergeStrategy, RejectOnDisagreement};

/// Multi-source record reconciliation daemon.
///
/// Watches for change notifications from data sources, fetches each
/// source's current record, merges it against the remembered baseline, and
/// either writes the merged record back everywhere or parks the unresolved
/// operations for an operator to resolve.
#[derive(Parser)]
#[command(name = "reconciler")]
#[command(version, about)]
struct Cli {
    /// Enable verbose (debug-level) logging, overriding `RUST_LOG`.
    #[arg(short, long)]
    verbose: bool,

    /// Database connection string, overriding the config file's `database`.
    #[arg(short, long = "db", value_name = "CONN")]
    db: Option<String>,

    /// Where to write logs when no OTLP endpoint is configured, overriding
    /// the config file's `logging`.
    #[arg(short, long = "log", value_name = "TARGET")]
    log: Option<LogArg>,

    /// Configuration file paths, applied in order (later files override
    /// earlier ones).
    config_paths: Vec<PathBuf>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum LogArg {
    Stderr,
    Stdout,
    None,
}

impl From<LogArg> for LoggingTarget {
    fn from(arg: LogArg) -> Self {
        match arg {
            LogArg::Stderr => Self::Stderr,
            LogArg::Stdout => Self::Stdout,
            LogArg::None => Self::None,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match ReconcilerConfig::load_merged(&cli.config_paths)
        .context("failed to load configuration")
    {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{err:#}");
            return ExitCode::from(1);
        }
    };

    if let Some(db) = cli.db {
        config.database = db;
    }
    if let Some(log) = cli.log {
        config.logging = log.into();
    }

    let _telemetry_guard =
        telemetry::init_with_target_and_verbosity(config.logging, cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(config: ReconcilerConfig) -> anyhow::Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let drivers = Arc::new(DriverRegistry::from_config(&config));
    let strategy: Box<dyn MergeStrategy> = match config.merge.strategy {
        MergeStrategyKind::RejectOnDisagreement => Box::new(RejectOnDisagreement),
    };
    let reconciler = Arc::new(
        Reconciler::new(Arc::clone(&store), Arc::clone(&drivers), strategy)
            .with_driver_timeout(std::time::Duration::from_secs(config.driver_timeout_secs)),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&reconciler),
        config.dispatcher.workers,
        config.dispatcher.retry_limit,
    ));
    let server = Server::new(store, reconciler, dispatcher, config.socket.clone());

    info!(socket = %config.socket.display(), database = %config.database, "starting reconciler");

    tokio::select! {
        result = server.run() => result.with_context(|| {
            format!("reconciler server on '{}' failed", config.socket.display())
        }),
        () = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
