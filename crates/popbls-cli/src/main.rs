use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use popbls_analytics::{AnalyticsConsumer, AnalyticsSettings, InProcessQueue, NotifyingStore};
use popbls_core::{AnalyticsMode, PipelineConfig, StoreBackend};
use popbls_sources::{
    HttpDirectoryTree, HttpPopulationSource, MemoryRemoteTree, PopulationSource, RemoteTree,
    StaticPopulationSource,
};
use popbls_storage::ContentStore;
use popbls_sync::{
    build_http, build_store, ensure_mirror_user_agent, run_ingestion_once, IngestionPipeline,
    MirrorTarget,
};
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "popbls")]
#[command(about = "Population + BLS ingestion and analytics pipeline")]
struct Cli {
    /// Override STORE_BACKEND (memory, fs, s3).
    #[arg(long, global = true)]
    store: Option<StoreBackend>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass (mirror sync if enabled, then population).
    Ingest,
    /// Run ingestion on the configured cron schedule until interrupted.
    Schedule,
    /// Process a queue event or notification document.
    Analyze {
        /// JSON file to read, or `-` for stdin.
        #[arg(long, default_value = "-")]
        event: String,
        #[arg(long)]
        mode: Option<AnalyticsMode>,
    },
    /// Ingest, relay the store writes, and drain analytics in one process.
    Pipeline {
        /// Population API payload to use instead of calling the API.
        #[arg(long)]
        population_fixture: Option<PathBuf>,
        /// Local directory served as the remote mirror tree; enables mirror sync.
        #[arg(long)]
        mirror_fixture: Option<PathBuf>,
        #[arg(long)]
        mode: Option<AnalyticsMode>,
    },
    /// Run only the remote mirror sync.
    SyncMirror,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn read_event(source: &str) -> Result<String> {
    if source == "-" {
        let mut buf = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buf)
            .await
            .context("reading event from stdin")?;
        return Ok(buf);
    }
    tokio::fs::read_to_string(source)
        .await
        .with_context(|| format!("reading event file {source}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();
    if let Some(backend) = cli.store {
        config.store_backend = backend;
    }

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let summary = run_ingestion_once(config).await?;
            print_json(&summary.response_body())?;
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let store = build_store(&config)?;
            let pipeline = Arc::new(IngestionPipeline::from_config(config, store)?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler was not built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().ingest_cron, "scheduler started; ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Analyze { event, mode } => {
            if let Some(mode) = mode {
                config.analytics_mode = mode;
            }
            let body = read_event(&event).await?;
            let consumer =
                AnalyticsConsumer::new(build_store(&config)?, AnalyticsSettings::from(&config));
            let outcome = consumer.handle_queue_event(&body).await;
            print_json(&outcome)?;
            if !outcome.failed_message_ids.is_empty() {
                anyhow::bail!(
                    "{} message(s) failed: {}",
                    outcome.failed_message_ids.len(),
                    outcome.failed_message_ids.join(", ")
                );
            }
        }
        Commands::Pipeline {
            population_fixture,
            mirror_fixture,
            mode,
        } => {
            if let Some(mode) = mode {
                config.analytics_mode = mode;
            }
            let base = build_store(&config)?;
            let queue = Arc::new(InProcessQueue::new());
            let store: Arc<dyn ContentStore> = Arc::new(NotifyingStore::new(
                base.clone(),
                queue.clone(),
                config.population_prefix.clone(),
            ));

            let tree: Arc<dyn RemoteTree> = match &mirror_fixture {
                Some(dir) => {
                    config.mirror_sync_enabled = true;
                    let root = MirrorTarget::from_config(&config)?.root_url;
                    Arc::new(MemoryRemoteTree::from_dir(&root, dir)?)
                }
                None => {
                    if config.mirror_sync_enabled {
                        ensure_mirror_user_agent(&config)?;
                    }
                    Arc::new(HttpDirectoryTree::new(build_http(&config)?))
                }
            };
            let source: Arc<dyn PopulationSource> = match &population_fixture {
                Some(path) => Arc::new(StaticPopulationSource::from_file(path)?),
                None => Arc::new(HttpPopulationSource::new(
                    build_http(&config)?,
                    config.population_api_url.clone(),
                )),
            };

            let settings = AnalyticsSettings::from(&config);
            let summary = IngestionPipeline::new(config, store, tree, source)
                .run_once()
                .await?;
            info!(key = %summary.population.key, "ingestion finished; draining analytics");

            let consumer = AnalyticsConsumer::new(base, settings);
            let drained = consumer.drain(queue.as_ref(), 10).await?;
            print_json(&serde_json::json!({
                "ingestion": summary,
                "analytics": drained,
            }))?;
        }
        Commands::SyncMirror => {
            let store = build_store(&config)?;
            let report = IngestionPipeline::from_config(config, store)?
                .sync_mirror()
                .await?;
            print_json(&report)?;
        }
    }

    Ok(())
}
