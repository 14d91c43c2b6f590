// ABOUTME: Run command - merges configured pipelines once and advances their watermarks
// ABOUTME: Pipelines without new changes are skipped unless --force is given

use anyhow::{bail, Result};

use crate::config::RollupConfig;
use crate::pipeline::{Connections, PipelineRunner};

/// Run the selected pipelines (all when `pipeline` is None) once.
pub async fn run(config: &RollupConfig, pipeline: Option<&str>, force: bool) -> Result<()> {
    let pipelines = config.select_pipelines(pipeline)?;
    if pipelines.is_empty() {
        bail!("No pipelines configured");
    }

    let connections = Connections::open(config).await?;
    let runner = PipelineRunner::new(config, &connections).await?;

    let mut failed = Vec::new();
    let mut rows_affected = 0u64;
    let mut pipelines_run = 0usize;

    for pipeline in pipelines {
        if !force {
            match runner.has_changes_for(pipeline).await {
                Ok(false) => {
                    println!("  {}: no new changes, skipped", pipeline.name);
                    continue;
                }
                Ok(true) => {}
                Err(e) => {
                    println!("  {}: change check failed: {}", pipeline.name, e);
                    failed.push(pipeline.name.clone());
                    continue;
                }
            }
        }

        match runner.run_pipeline(pipeline).await {
            Ok(result) => {
                pipelines_run += 1;
                rows_affected += result.affected_rows();
                println!(
                    "  {}: {} keys, {} rows affected, watermark {} -> {} ({}ms)",
                    result.pipeline,
                    result.stats.keys,
                    result.affected_rows(),
                    result.since_version,
                    result.as_of_version,
                    result.duration_ms
                );
            }
            Err(e) => {
                println!("  {}: failed: {:#}", pipeline.name, e);
                failed.push(pipeline.name.clone());
            }
        }
    }

    println!();
    println!("========================================");
    println!("Rollup run complete");
    println!("========================================");
    println!("  Pipelines run: {}", pipelines_run);
    println!("  Rows affected: {}", rows_affected);

    if !failed.is_empty() {
        println!("  Failed: {}", failed.join(", "));
        bail!("{} pipeline(s) failed", failed.len());
    }
    Ok(())
}
