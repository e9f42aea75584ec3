//! # Cooker
//!
//! Command-line entry point for the asset cooker.
//!
//! - `cooker cook <items...>` cooks the given root items and everything
//!   they reference, optionally spreading the work over `--workers` child
//!   processes.
//! - `cooker worker --director <addr>` is the child side; the director
//!   spawns these itself.
//!
//! The process exits 0 when every requested (item, platform) pair
//! succeeded and 1 otherwise.

mod config;

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};
use cooker_core::{
    content::{FsArtifactSink, FsContentProvider},
    cook::{CookSummary, Cooker, Instigator, Urgency},
    distrib::{Connection, TcpConnection, WorkerClient, WorkerExit},
    infra::cache::DiskCacheStore,
    types::{Platform, WorkerId},
};
use tokio::{net::TcpListener, process::Child};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ConfigLoad, ConfigLoader};

#[derive(Parser, Debug)]
#[command(name = "cooker", version)]
#[command(about = "Cooks source content into platform-specific artifacts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Cook root items and everything they reference
    Cook(CookArgs),
    /// Run as a worker for a director process
    Worker(WorkerArgs),
}

#[derive(ClapArgs, Debug, Clone)]
struct CookArgs {
    /// Root item ids, relative to the content root
    #[arg(required = true)]
    items: Vec<String>,

    /// Number of worker processes; 0 cooks in this process (overrides config)
    #[arg(long, env = "COOKER_WORKERS")]
    workers: Option<u32>,

    /// Target platforms, comma separated (overrides config)
    #[arg(long, value_delimiter = ',')]
    platform: Vec<String>,

    /// Skip items whose recorded inputs are unchanged (overrides config)
    #[arg(long)]
    incremental: Option<bool>,

    /// Directory holding source items
    #[arg(long)]
    content_root: Option<PathBuf>,

    /// Directory receiving cooked artifacts
    #[arg(long)]
    output: Option<PathBuf>,

    /// Build cache directory [default: <output>/.cook-cache]
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Path to a cooker.toml
    #[arg(long, env = "COOKER_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(ClapArgs, Debug, Clone)]
struct WorkerArgs {
    /// Address the director is listening on
    #[arg(long)]
    director: SocketAddr,

    /// Identifier assigned by the director
    #[arg(long)]
    worker_id: u32,

    /// Directory holding source items
    #[arg(long)]
    content_root: PathBuf,

    /// Path to the director's cooker.toml
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cook::summary=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Command::Cook(args) => run_cook(args).await,
        Command::Worker(args) => run_worker(args).await,
    }
}

async fn run_cook(args: CookArgs) -> anyhow::Result<ExitCode> {
    let started = Utc::now();
    let ConfigLoad { config, path } = ConfigLoader::new()
        .with_config_path(args.config.clone())
        .load()
        .context("failed to load cooker configuration")?;
    let (mut project, mut cook) = (config.project, config.cook);

    if let Some(workers) = args.workers {
        cook.distribution.workers = workers;
    }
    if let Some(incremental) = args.incremental {
        cook.cache.incremental = incremental;
    }
    if !args.platform.is_empty() {
        project.platforms = args.platform.clone();
    }
    if let Some(content_root) = args.content_root.clone() {
        project.content_root = content_root;
    }
    if let Some(output) = args.output.clone() {
        project.output = output;
    }
    if let Some(cache_dir) = args.cache_dir.clone() {
        project.cache_dir = Some(cache_dir);
    }

    let platforms = project.platforms();
    anyhow::ensure!(!platforms.is_empty(), "no target platform given");
    let workers = cook.distribution.workers;
    let cache_dir = project.cache_dir();
    info!(
        config_file = ?path,
        workers,
        platforms = %join_platforms(&platforms),
        incremental = cook.cache.incremental,
        content_root = %project.content_root.display(),
        output = %project.output.display(),
        cache_dir = %cache_dir.display(),
        "configuration in effect"
    );

    let mut cooker = Cooker::new(
        cook.clone(),
        Arc::new(FsContentProvider::new(&project.content_root)),
        Arc::new(FsArtifactSink::new(&project.output)),
        Box::new(DiskCacheStore::open(&cache_dir)),
    );

    let mut children = Vec::new();
    if workers > 0 {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .context("failed to bind the director socket")?;
        let addr = listener.local_addr()?;
        info!(target: "cook::director", %addr, workers, "director listening");
        for n in 1..=workers {
            children.push(spawn_worker_process(n, addr, &project.content_root, path.as_deref())?);
        }
        let connections = tokio::time::timeout(
            cook.distribution.connect_timeout(),
            TcpConnection::accept(&listener, workers as usize),
        )
        .await
        .context("workers did not connect in time")?
        .context("failed to accept worker connections")?;
        cooker = cooker.with_workers(
            connections
                .into_iter()
                .map(|connection| Box::new(connection) as Box<dyn Connection>)
                .collect(),
        );
    }

    let roots = args.items.clone();
    let connect_timeout = cook.distribution.connect_timeout();
    let summary = tokio::task::spawn_blocking(move || -> cooker_core::Result<CookSummary> {
        if workers > 0 {
            cooker.await_workers(connect_timeout)?;
        }
        for root in &roots {
            cooker.request_item(root.as_str(), &platforms, Urgency::Normal, Instigator::Root)?;
        }
        cooker.run()
    })
    .await
    .context("scheduler thread panicked")?
    .context("cook session failed")?;

    reap_workers(children, cook.distribution.shutdown_timeout()).await;
    report(&summary, started);
    Ok(ExitCode::from(summary.exit_code().clamp(0, 255) as u8))
}

fn spawn_worker_process(
    n: u32,
    director: SocketAddr,
    content_root: &Path,
    config: Option<&Path>,
) -> anyhow::Result<Child> {
    let exe = std::env::current_exe().context("cannot locate the cooker executable")?;
    let mut command = tokio::process::Command::new(exe);
    command
        .arg("worker")
        .arg("--director")
        .arg(director.to_string())
        .arg("--worker-id")
        .arg(n.to_string())
        .arg("--content-root")
        .arg(content_root)
        .kill_on_drop(true);
    if let Some(config) = config {
        command.arg("--config").arg(config);
    }
    let child = command
        .spawn()
        .with_context(|| format!("failed to spawn worker process {n}"))?;
    info!(target: "cook::director", worker = n, pid = ?child.id(), "worker process spawned");
    Ok(child)
}

async fn reap_workers(children: Vec<Child>, grace: Duration) {
    for mut child in children {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => warn!(target: "cook::director", %status, "worker process exited with failure"),
            Ok(Err(err)) => warn!(target: "cook::director", error = %err, "failed to wait on worker process"),
            Err(_) => {
                warn!(target: "cook::director", "worker process did not exit, killing it");
                if let Err(err) = child.kill().await {
                    warn!(target: "cook::director", error = %err, "failed to kill worker process");
                }
            }
        }
    }
}

fn report(summary: &CookSummary, started: DateTime<Utc>) {
    let elapsed = Utc::now() - started;
    info!(
        target: "cook::summary",
        started_at = %started.to_rfc3339(),
        elapsed_ms = elapsed.num_milliseconds(),
        remote_results = summary.remote_results,
        retries = summary.retries,
        "cook report"
    );
    println!(
        "cooked: {} succeeded, {} failed, {} invalid, {} from cache",
        summary.succeeded, summary.failed, summary.invalid, summary.cache_hits
    );
    if summary.failed_items > 0 {
        error!(target: "cook::summary", failed_items = summary.failed_items, "cook finished with failures");
        eprintln!("{} item(s) failed", summary.failed_items);
    }
}

fn join_platforms(platforms: &[Platform]) -> String {
    platforms
        .iter()
        .map(Platform::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

async fn run_worker(args: WorkerArgs) -> anyhow::Result<ExitCode> {
    let ConfigLoad { config, .. } = ConfigLoader::new()
        .with_config_path(args.config.clone())
        .without_default_locations()
        .load()
        .context("failed to load cooker configuration")?;
    let worker_id = WorkerId(args.worker_id);
    let connection = TcpConnection::connect(args.director)
        .await
        .with_context(|| format!("failed to reach the director at {}", args.director))?;
    info!(target: "cook::worker", worker = %worker_id, director = %args.director, "connected to director");

    let client = WorkerClient::new(
        worker_id,
        config.cook,
        Arc::new(FsContentProvider::new(&args.content_root)),
        Box::new(connection),
    );
    let exit = tokio::task::spawn_blocking(move || client.run())
        .await
        .context("worker thread panicked")?
        .context("worker loop failed")?;
    info!(target: "cook::worker", worker = %worker_id, ?exit, "worker finished");
    Ok(match exit {
        WorkerExit::CookComplete => ExitCode::SUCCESS,
        WorkerExit::Aborted | WorkerExit::DirectorLost => ExitCode::FAILURE,
    })
}
