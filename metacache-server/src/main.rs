//! metacache: local metadata cache for a remote ERP environment.
//!
//! Usage:
//!   metacache --base-url https://contoso.example.com serve --port 8420
//!   metacache --base-url https://contoso.example.com sync --strategy entitiesOnly
//!   metacache --base-url https://contoso.example.com search customer

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metacache_server::{build_router, AppState, StatsResponse};
use metacache_store::MetadataStore;
use metacache_sync::{
    CacheConfig, EntitySearch, HttpMetadataSource, HttpSourceConfig, PhaseEvent, ProgressSink,
    SyncRequest, SyncStrategy,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "metacache")]
#[command(about = "Versioned metadata cache and sync engine")]
struct Args {
    /// Base URL of the remote environment
    #[arg(long)]
    base_url: String,

    /// Display name for the environment (defaults to the base URL)
    #[arg(long)]
    name: Option<String>,

    /// Directory holding the cache database
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bearer token for the remote metadata API
    #[arg(long, env = "METACACHE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API
    Serve {
        #[arg(short, long, default_value = "8420")]
        port: u16,
    },
    /// Run one sync in the foreground
    Sync {
        #[arg(long, default_value = "full")]
        strategy: SyncStrategy,
        /// Re-run phases even when the cached version looks current
        #[arg(long)]
        force: bool,
    },
    /// Search cached data and public entities
    Search {
        query: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Resolve a label through the cache
    Label {
        id: String,
        #[arg(long)]
        language: Option<String>,
    },
    /// Print store statistics
    Stats,
}

/// Logs phase events as they arrive.
struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_event(&self, event: &PhaseEvent) {
        match event {
            PhaseEvent::Started { phase, total } => info!(%phase, ?total, "phase started"),
            PhaseEvent::Progress {
                phase,
                processed,
                total,
            } => debug!(%phase, processed, ?total, "phase progress"),
            PhaseEvent::Completed { phase, processed } => {
                info!(%phase, processed, "phase completed")
            }
            PhaseEvent::Skipped { phase, reason } => info!(%phase, %reason, "phase skipped"),
            PhaseEvent::Failed { phase, message } => warn!(%phase, %message, "phase failed"),
            PhaseEvent::Cancelled { phase } => warn!(%phase, "phase cancelled"),
        }
    }

    fn on_plan(&self, strategy: SyncStrategy) {
        info!(%strategy, "sync planned");
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn load_config(args: &Args) -> Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(dir) = &args.cache_dir {
        config.cache_dir = dir.clone();
    }
    Ok(config)
}

async fn build_state(args: &Args, config: CacheConfig) -> Result<Arc<AppState>> {
    let store = MetadataStore::open_in_dir(&config.cache_dir)
        .with_context(|| format!("Failed to open cache in {}", config.cache_dir.display()))?;
    let mut source_config = HttpSourceConfig::new(args.base_url.clone());
    if let Some(token) = &args.token {
        source_config = source_config.with_token(token.clone());
    }
    let source = HttpMetadataSource::new(source_config).context("Invalid remote source")?;
    let name = args.name.as_deref().unwrap_or(&args.base_url);
    let state = AppState::new(
        Arc::new(store),
        Arc::new(source),
        &args.base_url,
        name,
        config,
    )
    .await
    .context("Failed to register environment")?;
    Ok(Arc::new(state))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to encode output")?
    );
    Ok(())
}

async fn serve(state: Arc<AppState>, port: u16, sweep_interval: std::time::Duration) -> Result<()> {
    let sweeper = state.sessions.spawn_sweeper(
        Arc::clone(&state.engine),
        state.label_cache().clone(),
        sweep_interval,
    );

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .with_context(|| format!("Failed to bind HTTP port {port}"))?;
    info!(port, environment = %state.engine.environment().base_url, "HTTP API listening");

    let sessions = state.sessions.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutting down");
            sessions.shutdown();
        })
        .await
        .context("HTTP server failed")?;

    if let Err(e) = sweeper.await {
        warn!(error = %e, "sweeper task failed");
    }
    Ok(())
}

async fn sync(state: &AppState, request: SyncRequest) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("cancelling sync");
            on_signal.cancel();
        }
    });
    let outcome = state
        .engine
        .sync(&request, &cancel, &LogProgress)
        .await
        .context("Sync failed")?;
    print_json(&outcome)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(&args)?;
    let sweep_interval = config.sweep_interval();
    let state = build_state(&args, config).await?;

    match args.command {
        Command::Serve { port } => serve(state, port, sweep_interval).await,
        Command::Sync { strategy, force } => {
            let mut request = SyncRequest::new(strategy);
            request.force = force;
            sync(&state, request).await
        }
        Command::Search { query, limit } => {
            let hits = state
                .query
                .search_entities(&query, &EntitySearch::default(), limit)
                .await
                .context("Search failed")?;
            print_json(&hits)
        }
        Command::Label { id, language } => {
            let language = language.unwrap_or_else(|| state.language.clone());
            let version = state.query.current_version().await?.map(|v| v.id);
            match state.labels.resolve(version, &id, &language).await? {
                Some(label) => print_json(&label),
                None => anyhow::bail!("label {id} ({language}) not found"),
            }
        }
        Command::Stats => {
            let stats = StatsResponse {
                store: state.query.statistics().await?,
                environments: state.query.environment_statistics().await?,
            };
            print_json(&stats)
        }
    }
}
