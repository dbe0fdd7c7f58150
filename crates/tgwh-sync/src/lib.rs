//! Ingestion pipeline: configuration, warehouse sinks, bulk loading, scrape
//! coordination and staging-directory triggers.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tgwh_channels::{ChannelClient, FixtureChannelClient, WebPreviewClient};
use tgwh_core::{DataLakeSummary, ImageRecord};
use tgwh_storage::{DataLake, HttpClientConfig};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub mod config;
pub mod coordinator;
pub mod loader;
pub mod logging;
pub mod report;
pub mod trigger;
pub mod warehouse;

pub use config::{ChannelBackend, ConfigError, PipelineConfig, ScrapePacing};
pub use coordinator::ScrapeCoordinator;
pub use loader::{BulkLoader, LoadError};
pub use report::{ChannelOutcome, FileOutcome, LoadReport, OutcomeStatus, ScrapeRunReport};
pub use trigger::{DirectoryTrigger, RunLedger, TriggerDecision};
pub use warehouse::{MemoryWarehouse, PgWarehouse, RawSink, WarehouseRow};

pub const CRATE_NAME: &str = "tgwh-sync";

/// Connects and pings the warehouse, or returns an in-memory sink for dry runs.
pub async fn open_sink(config: &PipelineConfig, dry_run: bool) -> Result<Arc<dyn RawSink>> {
    if dry_run {
        info!("dry run: rows are kept in memory");
        return Ok(Arc::new(MemoryWarehouse::new()));
    }
    config.validate_database()?;
    let warehouse = PgWarehouse::connect(&config.database.url())
        .await
        .with_context(|| format!("connecting to {}", config.database.redacted_url()))?;
    warehouse.ping().await?;
    info!(database = %config.database.redacted_url(), "warehouse connection successful");
    Ok(Arc::new(warehouse))
}

pub fn build_client(config: &PipelineConfig) -> Box<dyn ChannelClient> {
    match config.backend {
        ChannelBackend::Web => Box::new(WebPreviewClient::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.http_user_agent.clone()),
            ..Default::default()
        })),
        ChannelBackend::Fixtures => Box::new(FixtureChannelClient::new(&config.fixtures_dir)),
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    loader: BulkLoader,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, sink: Arc<dyn RawSink>) -> Self {
        let loader = BulkLoader::new(DataLake::new(&config.data_lake_path), sink)
            .with_batch_size(config.load_batch_size);
        Self { config, loader }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn loader(&self) -> &BulkLoader {
        &self.loader
    }

    pub async fn scrape(&self) -> Result<ScrapeRunReport> {
        let mut client = build_client(&self.config);
        self.scrape_with(client.as_mut()).await
    }

    /// Scrape over a caller-owned session.
    pub async fn scrape_with<C: ChannelClient + ?Sized>(&self, client: &mut C) -> Result<ScrapeRunReport> {
        let coordinator = ScrapeCoordinator::new(self.loader.clone(), self.config.pacing.clone());
        let report = coordinator.run(client, &self.config.channels).await;
        let path = report::write_run_report(&self.config.reports_dir, report.run_id, &report).await?;
        info!(
            path = %path.display(),
            "Successfully scraped {} messages from {} channels",
            report.total_messages,
            report.scraped_channels()
        );
        Ok(report)
    }

    pub async fn load(&self, date_folder: Option<&str>) -> Result<LoadReport> {
        let report = self.loader.load_all(date_folder).await?;
        let path = report::write_run_report(&self.config.reports_dir, report.run_id, &report).await?;
        info!(path = %path.display(), total_rows = report.total_rows, "Total messages loaded");
        Ok(report)
    }

    /// Scrape, then reload every staged file. Files staged by this run are
    /// appended a second time; the warehouse does not dedup raw rows.
    pub async fn both(&self) -> Result<(ScrapeRunReport, LoadReport)> {
        let scrape = self.scrape().await?;
        let load = self.load(None).await?;
        Ok((scrape, load))
    }

    pub fn trigger(&self) -> DirectoryTrigger {
        DirectoryTrigger::new(self.config.messages_dir(), &self.config.state_dir)
    }

    /// Polls the staging directory and loads on each new run key until Ctrl-C.
    pub async fn watch(&self) -> Result<()> {
        let (mut sched, mut requests) =
            trigger::spawn_watch(self.trigger(), self.config.trigger_poll).await?;
        let loads = self
            .serve_run_requests(&mut requests, tokio::signal::ctrl_c())
            .await;
        info!(loads, "watch stopped");
        sched.shutdown().await.context("stopping scheduler")?;
        Ok(())
    }

    /// Loads once per newer run request until `shutdown` resolves or the
    /// request channel closes. `shutdown` is polled first on every turn, so a
    /// signal that arrives during a load ends the loop once that load returns.
    /// Returns the number of loads started.
    pub async fn serve_run_requests<F>(
        &self,
        requests: &mut mpsc::Receiver<TriggerDecision>,
        shutdown: F,
    ) -> usize
    where
        F: Future,
    {
        let mut ledger = RunLedger::default();
        let mut loads = 0;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                request = requests.recv() => {
                    let Some(decision) = request else { break };
                    let TriggerDecision::RunRequest { run_key, cursor } = decision else { continue };
                    if !ledger.admit(cursor) {
                        warn!(run_key, "duplicate run request ignored");
                        continue;
                    }
                    info!(run_key, "running load for new staged data");
                    loads += 1;
                    if let Err(err) = self.load(None).await {
                        error!(run_key, error = %format!("{err:#}"), "triggered load failed");
                    }
                }
            }
        }
        loads
    }

    pub fn summary(&self) -> Result<DataLakeSummary> {
        self.loader.summarize()
    }

    pub fn images(&self, date_folder: Option<&str>) -> Result<Vec<ImageRecord>> {
        self.loader.lake().scan_images(date_folder)
    }

    pub async fn load_detections(&self, path: &Path) -> Result<u64> {
        self.loader.load_detections_file(path).await
    }
}

async fn pipeline_from_env(scrape: bool, database: bool) -> Result<Pipeline> {
    let config = PipelineConfig::from_env()?;
    config.validate(scrape, database)?;
    let sink = open_sink(&config, !database).await?;
    Ok(Pipeline::new(config, sink))
}

pub async fn run_scrape_from_env(dry_run: bool) -> Result<ScrapeRunReport> {
    pipeline_from_env(true, !dry_run).await?.scrape().await
}

pub async fn run_load_from_env(date_folder: Option<&str>, dry_run: bool) -> Result<LoadReport> {
    pipeline_from_env(false, !dry_run).await?.load(date_folder).await
}

pub async fn run_both_from_env(dry_run: bool) -> Result<(ScrapeRunReport, LoadReport)> {
    pipeline_from_env(true, !dry_run).await?.both().await
}

pub async fn run_watch_from_env(dry_run: bool) -> Result<()> {
    pipeline_from_env(false, !dry_run).await?.watch().await
}

pub async fn load_detections_from_env(path: &Path, dry_run: bool) -> Result<u64> {
    pipeline_from_env(false, !dry_run).await?.load_detections(path).await
}

pub async fn migrate_from_env() -> Result<()> {
    let config = PipelineConfig::from_env()?;
    config.validate_database()?;
    let warehouse = PgWarehouse::connect(&config.database.url()).await?;
    warehouse.migrate().await
}

/// Names-only inventory; needs no credentials.
pub fn summary_from_env() -> Result<DataLakeSummary> {
    let config = PipelineConfig::from_env()?;
    DataLake::new(&config.data_lake_path).summarize()
}

pub fn images_from_env(date_folder: Option<&str>) -> Result<Vec<ImageRecord>> {
    let config = PipelineConfig::from_env()?;
    DataLake::new(&config.data_lake_path).scan_images(date_folder)
}
