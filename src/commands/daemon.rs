// ABOUTME: Daemon command - runs all configured pipelines on a fixed interval until Ctrl+C
// ABOUTME: A failed pipeline is retried on the next cycle from its stored watermark

use anyhow::{bail, Result};
use std::time::Duration;

use crate::config::RollupConfig;
use crate::pipeline::{Connections, PipelineRunner};
use crate::rollup::daemon::{DaemonConfig, RollupDaemon};

pub async fn daemon(
    config: &RollupConfig,
    interval: Duration,
    force: bool,
    shutdown: tokio::sync::broadcast::Receiver<()>,
) -> Result<()> {
    if config.pipelines.is_empty() {
        bail!("No pipelines configured");
    }
    if interval.is_zero() {
        bail!("Daemon interval must be at least one second");
    }

    let connections = Connections::open(config).await?;
    let runner = PipelineRunner::new(config, &connections).await?;
    let daemon = RollupDaemon::new(runner, DaemonConfig { interval, force });

    println!();
    println!("========================================");
    println!("Starting rollup daemon");
    println!("========================================");
    println!("  Pipelines: {}", config.pipelines.len());
    println!("  Interval: {}s", interval.as_secs());
    println!("  Press Ctrl+C to stop");
    println!();

    daemon.run(shutdown).await;
    Ok(())
}
