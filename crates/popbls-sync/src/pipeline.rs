//! Scheduled ingestion trigger: mirror sync (optional) then population fetch.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use popbls_core::{PipelineConfig, StoreBackend};
use popbls_sources::{HttpDirectoryTree, HttpPopulationSource, PopulationSource, RemoteTree};
use popbls_storage::{
    ContentStore, FsContentStore, HttpClientConfig, HttpFetcher, MemoryContentStore,
    S3ContentStore, S3StoreConfig,
};
use serde::Serialize;
use serde_json::json;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::mirror::{MirrorSyncer, MirrorTarget, SyncReport};
use crate::population::{PopulationFetcher, PopulationUpload};

#[derive(Debug, Clone, Serialize)]
pub struct IngestionSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub bucket: String,
    pub population: PopulationUpload,
    /// `None` when mirror sync is switched off.
    pub mirror: Option<SyncReport>,
}

impl IngestionSummary {
    /// Response body handed back to whatever invoked the run.
    pub fn response_body(&self) -> serde_json::Value {
        json!({
            "message": "Ingestion completed",
            "population_key": self.population.key,
        })
    }
}

/// Construct the configured content store backend.
pub fn build_store(config: &PipelineConfig) -> Result<Arc<dyn ContentStore>> {
    let store: Arc<dyn ContentStore> = match config.store_backend {
        StoreBackend::Memory => Arc::new(MemoryContentStore::new(config.bucket_name())),
        StoreBackend::Fs => Arc::new(FsContentStore::new(
            config.bucket_name(),
            config.store_root.clone(),
        )),
        StoreBackend::S3 => {
            let bucket = config
                .bucket
                .clone()
                .context("BUCKET must be set for the s3 store backend")?;
            Arc::new(
                S3ContentStore::new(&S3StoreConfig {
                    bucket,
                    region: config.aws_region.clone(),
                    endpoint_url: config.aws_endpoint_url.clone(),
                })
                .context("building s3 content store")?,
            )
        }
    };
    Ok(store)
}

pub fn build_http(config: &PipelineConfig) -> Result<Arc<HttpFetcher>> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        min_interval: config.http_min_interval_ms.map(Duration::from_millis),
    })?;
    Ok(Arc::new(http))
}

/// The public file server rejects anonymous crawlers, so a mirror run over
/// HTTP needs a `HTTP_USER_AGENT` carrying a contact address.
pub fn ensure_mirror_user_agent(config: &PipelineConfig) -> Result<()> {
    if !config.user_agent_has_contact() {
        anyhow::bail!(
            "HTTP_USER_AGENT {:?} has no contact address; set it to something like \
             \"popbls/0.1 (ops@example.org)\" before mirroring over HTTP",
            config.user_agent
        );
    }
    Ok(())
}

pub struct IngestionPipeline {
    config: PipelineConfig,
    store: Arc<dyn ContentStore>,
    mirror: MirrorSyncer,
    population: PopulationFetcher,
    http_mirror: bool,
}

impl IngestionPipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn ContentStore>,
        tree: Arc<dyn RemoteTree>,
        source: Arc<dyn PopulationSource>,
    ) -> Self {
        let mirror = MirrorSyncer::new(store.clone(), tree);
        let population =
            PopulationFetcher::new(store.clone(), source, config.population_prefix.clone());
        Self {
            config,
            store,
            mirror,
            population,
            http_mirror: false,
        }
    }

    /// Wire the HTTP-backed remote tree and population API from `config`.
    pub fn from_config(config: PipelineConfig, store: Arc<dyn ContentStore>) -> Result<Self> {
        let http = build_http(&config)?;
        let tree = Arc::new(HttpDirectoryTree::new(http.clone()));
        let source = Arc::new(HttpPopulationSource::new(
            http,
            config.population_api_url.clone(),
        ));
        Ok(Self {
            http_mirror: true,
            ..Self::new(config, store, tree, source)
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Run the mirror sync on its own, regardless of the on/off switch.
    pub async fn sync_mirror(&self) -> Result<SyncReport> {
        if self.http_mirror {
            ensure_mirror_user_agent(&self.config)?;
        }
        self.mirror.sync(&MirrorTarget::from_config(&self.config)?).await
    }

    /// One ingestion run. Errors from either stage propagate unhandled; retry
    /// policy belongs to whoever scheduled the run.
    pub async fn run_once(&self) -> Result<IngestionSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingestion_run", %run_id);
        self.run_stages(run_id).instrument(span).await
    }

    async fn run_stages(&self, run_id: Uuid) -> Result<IngestionSummary> {
        let started_at = Utc::now();
        info!(bucket = self.store.bucket(), "starting ingestion run");

        let mirror = if self.config.mirror_sync_enabled {
            Some(self.sync_mirror().await.context("mirror sync stage")?)
        } else {
            info!("mirror sync disabled; skipping");
            None
        };

        let population = self.population.run().await.context("population stage")?;
        info!(key = %population.key, deduplicated = population.deduplicated, "population data stored");

        Ok(IngestionSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            bucket: self.store.bucket().to_string(),
            population,
            mirror,
        })
    }

    /// Cron scheduler running [`Self::run_once`] per tick, if enabled.
    ///
    /// A failed run is logged; the next tick is the retry.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = &self.config.ingest_cron;
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        key = %summary.population.key,
                        "scheduled ingestion run complete"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled ingestion run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// One HTTP-backed ingestion run against the store `config` selects.
pub async fn run_ingestion_once(config: PipelineConfig) -> Result<IngestionSummary> {
    let store = build_store(&config)?;
    IngestionPipeline::from_config(config, store)?.run_once().await
}
