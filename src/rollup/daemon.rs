// ABOUTME: RollupDaemon - runs every configured pipeline on a fixed interval
// ABOUTME: Pipelines run one after another; a failed pipeline retries next cycle from its watermark

use anyhow::Result;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::time::interval;

use super::orchestrator::RunResult;

/// The pipelines a daemon cycle runs.
///
/// Errors are reported, not retried; the next cycle starts each pipeline
/// from its stored watermark again.
#[async_trait]
pub trait PipelineSet: Send + Sync {
    fn pipeline_names(&self) -> Vec<String>;

    async fn has_changes(&self, pipeline: &str) -> Result<bool>;

    async fn run(&self, pipeline: &str) -> Result<RunResult>;
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Interval between cycles
    pub interval: Duration,
    /// Run pipelines even when the change check reports nothing new
    pub force: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            force: false,
        }
    }
}

/// Statistics from one cycle over all pipelines.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub pipelines_run: usize,
    pub pipelines_skipped: usize,
    pub rows_affected: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl CycleStats {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct RollupDaemon<P> {
    config: DaemonConfig,
    pipelines: P,
}

impl<P: PipelineSet> RollupDaemon<P> {
    pub fn new(pipelines: P, config: DaemonConfig) -> Self {
        Self { config, pipelines }
    }

    /// Run each pipeline once. Failures are collected, not propagated.
    pub async fn run_cycle(&self) -> CycleStats {
        let start = Instant::now();
        let mut stats = CycleStats::default();

        for name in self.pipelines.pipeline_names() {
            if !self.config.force {
                match self.pipelines.has_changes(&name).await {
                    Ok(false) => {
                        tracing::debug!("No changes for pipeline '{}', skipping", name);
                        stats.pipelines_skipped += 1;
                        continue;
                    }
                    Ok(true) => {}
                    Err(e) => {
                        stats.errors.push(format!("{}: {}", name, e));
                        continue;
                    }
                }
            }

            match self.pipelines.run(&name).await {
                Ok(result) => {
                    stats.pipelines_run += 1;
                    stats.rows_affected += result.affected_rows();
                }
                // Already logged by the orchestrator
                Err(e) => stats.errors.push(format!("{}: {}", name, e)),
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        stats
    }

    /// Run cycles until `shutdown` fires.
    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.interval);
        let mut cycles = 0u64;

        tracing::info!(
            "Starting RollupDaemon with interval={:?}, force={}",
            self.config.interval,
            self.config.force
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping RollupDaemon");
                    break;
                }
                _ = ticker.tick() => {
                    cycles += 1;
                    tracing::debug!("Starting rollup cycle {}", cycles);

                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            tracing::info!("Shutdown signal received during rollup cycle, aborting");
                            break;
                        }
                        stats = self.run_cycle() => {
                            tracing::info!(
                                "Rollup cycle {} completed: {} run, {} skipped, {} rows in {}ms",
                                cycles,
                                stats.pipelines_run,
                                stats.pipelines_skipped,
                                stats.rows_affected,
                                stats.duration_ms
                            );
                            if !stats.is_success() {
                                tracing::warn!("Rollup cycle had {} errors", stats.errors.len());
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RollupError;
    use crate::rollup::memory::{MemoryChangeFeed, MemoryWatermarkStore};
    use crate::rollup::merge::{MergeLogic, MergeStats};
    use crate::rollup::orchestrator::Rollup;

    struct CountingMerge;

    #[async_trait]
    impl MergeLogic for CountingMerge {
        fn name(&self) -> &str {
            "counting"
        }

        async fn merge_since(&self, _since_version: i64) -> Result<MergeStats, RollupError> {
            Ok(MergeStats {
                keys: 2,
                rows_deleted: 2,
                rows_inserted: 2,
            })
        }
    }

    /// Two pipelines over one feed; "broken" always fails.
    struct TestPipelines {
        feed: MemoryChangeFeed,
        store: MemoryWatermarkStore,
    }

    #[async_trait]
    impl PipelineSet for TestPipelines {
        fn pipeline_names(&self) -> Vec<String> {
            vec!["sales".to_string(), "broken".to_string()]
        }

        async fn has_changes(&self, pipeline: &str) -> Result<bool> {
            Ok(Rollup::new(pipeline, &self.feed, &self.store)
                .has_changes()
                .await?)
        }

        async fn run(&self, pipeline: &str) -> Result<RunResult> {
            if pipeline == "broken" {
                return Err(RollupError::ChangeQuery {
                    table: "broken_rollup".to_string(),
                    source: anyhow::anyhow!("relation does not exist"),
                }
                .into());
            }
            Ok(Rollup::new(pipeline, &self.feed, &self.store)
                .run(&CountingMerge)
                .await?)
        }
    }

    fn daemon(force: bool) -> RollupDaemon<TestPipelines> {
        RollupDaemon::new(
            TestPipelines {
                feed: MemoryChangeFeed::new(),
                store: MemoryWatermarkStore::new(),
            },
            DaemonConfig {
                interval: Duration::from_millis(10),
                force,
            },
        )
    }

    #[test]
    fn test_daemon_config_default() {
        let config = DaemonConfig::default();
        assert_eq!(config.interval, Duration::from_secs(60));
        assert!(!config.force);
    }

    #[tokio::test]
    async fn test_cycle_skips_unchanged_pipelines() {
        let daemon = daemon(false);
        let stats = daemon.run_cycle().await;
        assert_eq!(stats.pipelines_skipped, 2);
        assert_eq!(stats.pipelines_run, 0);
        assert!(stats.is_success());
    }

    #[tokio::test]
    async fn test_cycle_records_failures_and_continues() {
        let daemon = daemon(false);
        daemon.pipelines.feed.record("detail_sales");

        let stats = daemon.run_cycle().await;
        assert_eq!(stats.pipelines_run, 1);
        assert_eq!(stats.rows_affected, 2);
        assert_eq!(stats.errors.len(), 1);
        assert!(stats.errors[0].starts_with("broken:"));
        assert_eq!(daemon.pipelines.store.get("sales").unwrap().version, 1);
        assert!(daemon.pipelines.store.get("broken").is_none());
    }

    #[tokio::test]
    async fn test_forced_cycle_runs_without_changes() {
        let daemon = daemon(true);
        let stats = daemon.run_cycle().await;
        assert_eq!(stats.pipelines_run, 1);
        assert_eq!(stats.pipelines_skipped, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let daemon = daemon(false);
        let (tx, rx) = tokio::sync::broadcast::channel(1);
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), daemon.run(rx))
            .await
            .unwrap();
    }
}
