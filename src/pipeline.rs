// ABOUTME: Builds runnable rollup pipelines from configuration
// ABOUTME: Wires connections, change feed, watermark store and per-table merges together

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_postgres::Client;

use crate::config::{PipelineConfig, RollupConfig, Strategy, WatermarkBackend};
use crate::postgres::{connect_with_retry, AtomicMerge, PgBulkSink, PgChangeFeed, PgWatermarkStore};
use crate::postgres::sql_table::SqlRollupTable;
use crate::rollup::daemon::PipelineSet;
use crate::rollup::merge::{MergeSet, SinglePhaseMerge, TwoPhaseMerge};
use crate::rollup::orchestrator::{Rollup, RunResult};
use crate::rollup::watermark::{FileWatermarkStore, Watermark, WatermarkStore};
use crate::utils::sanitize_url;

/// Source and target connections of one process.
///
/// The target gets its own connection even when both URLs are equal, so an
/// atomic merge's transaction holds nothing but rollup writes.
pub struct Connections {
    source: Client,
    target: Client,
}

impl Connections {
    pub async fn open(config: &RollupConfig) -> Result<Self> {
        let source_url = config.source_url()?;
        let target_url = config.target_url()?;

        tracing::info!("Connecting to source {}", sanitize_url(source_url));
        let source = connect_with_retry(source_url)
            .await
            .context("Failed to connect to source database")?;

        tracing::info!("Connecting to target {}", sanitize_url(target_url));
        let target = connect_with_retry(target_url)
            .await
            .context("Failed to connect to target database")?;

        Ok(Self { source, target })
    }

    /// Connection holding the transactional tables and the change log.
    pub fn source(&self) -> &Client {
        &self.source
    }

    /// Connection holding the rollup tables.
    pub fn target(&self) -> &Client {
        &self.target
    }
}

/// Open the configured watermark store, creating its table if needed.
pub async fn open_watermark_store<'a>(
    config: &RollupConfig,
    target: &'a Client,
) -> Result<Box<dyn WatermarkStore + 'a>> {
    match config.watermarks.backend {
        WatermarkBackend::Postgres => {
            let store = PgWatermarkStore::new(target, &config.watermarks.table)?;
            store.ensure_table().await?;
            tracing::debug!("Using watermark table {}", config.watermarks.table);
            Ok(Box::new(store))
        }
        WatermarkBackend::File => {
            tracing::debug!("Using watermark file {:?}", config.watermarks.path);
            Ok(Box::new(FileWatermarkStore::new(config.watermarks.path.clone())))
        }
    }
}

/// Runs configured pipelines over a pair of connections.
pub struct PipelineRunner<'a> {
    config: &'a RollupConfig,
    connections: &'a Connections,
    store: Box<dyn WatermarkStore + 'a>,
}

impl<'a> PipelineRunner<'a> {
    pub async fn new(config: &'a RollupConfig, connections: &'a Connections) -> Result<Self> {
        let store = open_watermark_store(config, connections.target()).await?;
        Ok(Self {
            config,
            connections,
            store,
        })
    }

    pub fn config(&self) -> &RollupConfig {
        self.config
    }

    pub fn store(&self) -> &dyn WatermarkStore {
        self.store.as_ref()
    }

    /// Change feed restricted to the pipeline's tracked tables.
    pub fn change_feed(&self, pipeline: &PipelineConfig) -> Result<PgChangeFeed<'a>> {
        PgChangeFeed::new(self.connections.source(), &self.config.change_feed.log_table)?
            .with_tables(&pipeline.tracked_tables)
    }

    pub async fn watermark(&self, pipeline: &PipelineConfig) -> Result<Watermark> {
        let feed = self.change_feed(pipeline)?;
        Ok(Rollup::new(&pipeline.name, &feed, self.store()).watermark().await?)
    }

    pub async fn has_changes_for(&self, pipeline: &PipelineConfig) -> Result<bool> {
        let feed = self.change_feed(pipeline)?;
        Ok(Rollup::new(&pipeline.name, &feed, self.store()).has_changes().await?)
    }

    /// Merge every table of `pipeline` in declaration order and advance its
    /// watermark.
    pub async fn run_pipeline(&self, pipeline: &PipelineConfig) -> Result<RunResult> {
        let feed = self.change_feed(pipeline)?;
        let sink = PgBulkSink::new(self.connections.target());

        let mut merges = MergeSet::new(&pipeline.name);
        for table in &pipeline.tables {
            let source = SqlRollupTable::new(
                self.connections.source(),
                table.schema(),
                table.sql_strategy()?,
            )?;
            match table.strategy {
                Strategy::SinglePhase => merges.push(
                    SinglePhaseMerge::new(source, &sink).with_chunk_size(pipeline.chunk_size),
                ),
                Strategy::TwoPhase => merges.push(
                    TwoPhaseMerge::new(source, &sink).with_chunk_size(pipeline.chunk_size),
                ),
            }
        }

        let rollup = Rollup::new(&pipeline.name, &feed, self.store());
        let result = if pipeline.atomic {
            rollup
                .run(&AtomicMerge::new(self.connections.target(), merges))
                .await?
        } else {
            rollup.run(&merges).await?
        };
        Ok(result)
    }
}

#[async_trait]
impl PipelineSet for PipelineRunner<'_> {
    fn pipeline_names(&self) -> Vec<String> {
        self.config.pipelines.iter().map(|p| p.name.clone()).collect()
    }

    async fn has_changes(&self, pipeline: &str) -> Result<bool> {
        self.has_changes_for(self.config.pipeline(pipeline)?).await
    }

    async fn run(&self, pipeline: &str) -> Result<RunResult> {
        self.run_pipeline(self.config.pipeline(pipeline)?).await
    }
}
