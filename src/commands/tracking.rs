// ABOUTME: Change log maintenance - installs capture triggers and prunes consumed changes
// ABOUTME: Pruning never removes changes a configured pipeline has not merged yet

use anyhow::{bail, Result};

use crate::config::{RollupConfig, WatermarkBackend};
use crate::pipeline::{open_watermark_store, Connections, PipelineRunner};
use crate::postgres::change_feed::qualify;
use crate::postgres::PgChangeFeed;

/// Create the change log and capture triggers for the tracked tables of the
/// selected pipelines, plus the watermark table when it lives in PostgreSQL.
pub async fn install_tracking(config: &RollupConfig, pipeline: Option<&str>) -> Result<()> {
    let mut tables: Vec<String> = Vec::new();
    for pipeline in config.select_pipelines(pipeline)? {
        if pipeline.tracked_tables.is_empty() {
            tracing::warn!(
                "Pipeline '{}' lists no tracked_tables; nothing to install for it",
                pipeline.name
            );
        }
        for table in &pipeline.tracked_tables {
            let table = qualify(table);
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
    }
    if tables.is_empty() {
        bail!("No tracked tables configured");
    }

    let connections = Connections::open(config).await?;
    let feed = PgChangeFeed::new(connections.source(), &config.change_feed.log_table)?;
    for table in &tables {
        feed.install_tracking(table).await?;
        println!("✓ Tracking changes of {}", table);
    }

    if config.watermarks.backend == WatermarkBackend::Postgres {
        open_watermark_store(config, connections.target()).await?;
        println!("✓ Watermark table {} is ready", config.watermarks.table);
    }
    Ok(())
}

/// Delete change records every configured pipeline has already merged.
pub async fn prune(config: &RollupConfig) -> Result<()> {
    if config.pipelines.is_empty() {
        bail!("No pipelines configured; refusing to prune without watermarks");
    }

    let connections = Connections::open(config).await?;
    let runner = PipelineRunner::new(config, &connections).await?;

    let mut up_to = i64::MAX;
    for pipeline in &config.pipelines {
        let watermark = runner.watermark(pipeline).await?;
        tracing::debug!("Pipeline '{}' is at version {}", pipeline.name, watermark.version);
        up_to = up_to.min(watermark.version);
    }

    let feed = PgChangeFeed::new(connections.source(), &config.change_feed.log_table)?;
    let removed = feed.prune(up_to).await?;
    println!(
        "✓ Pruned {} change records at or below version {} from {}",
        removed,
        up_to,
        feed.log_table()
    );
    Ok(())
}
