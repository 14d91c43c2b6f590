// ABOUTME: Status command - shows each pipeline's watermark and whether changes are pending
// ABOUTME: Reads only; never advances a watermark

use anyhow::Result;

use crate::config::RollupConfig;
use crate::pipeline::{Connections, PipelineRunner};

pub async fn status(config: &RollupConfig) -> Result<()> {
    let connections = Connections::open(config).await?;
    let runner = PipelineRunner::new(config, &connections).await?;

    println!();
    println!("========================================");
    println!("Rollup pipeline status");
    println!("========================================");

    if config.pipelines.is_empty() {
        println!("  No pipelines configured");
        return Ok(());
    }

    for pipeline in &config.pipelines {
        let watermark = runner.watermark(pipeline).await?;
        let last_sync = watermark
            .last_sync_utc
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        let pending = match runner.has_changes_for(pipeline).await {
            Ok(true) => "changes pending".to_string(),
            Ok(false) => "up to date".to_string(),
            Err(e) => format!("change check failed: {}", e),
        };
        println!(
            "  {}: version {}, last sync {}, {}",
            pipeline.name, watermark.version, last_sync, pending
        );
    }
    Ok(())
}
