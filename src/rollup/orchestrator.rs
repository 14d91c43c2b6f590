// ABOUTME: Watermark orchestrator - read watermark, capture sequence, merge, advance
// ABOUTME: The only place a pipeline's watermark moves; failures are logged once and returned

use chrono::{DateTime, Utc};
use std::time::Instant;

use super::feed::ChangeFeed;
use super::merge::{MergeLogic, MergeStats};
use super::watermark::{Watermark, WatermarkStore};
use crate::error::{Result, RollupError};

/// Outcome of one successful pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub pipeline: String,
    /// Watermark version the merge started from
    pub since_version: i64,
    /// Sequence number captured before the merge; the new watermark version
    pub as_of_version: i64,
    pub stats: MergeStats,
    pub duration_ms: u64,
    pub last_sync_utc: Option<DateTime<Utc>>,
}

impl RunResult {
    pub fn affected_rows(&self) -> u64 {
        self.stats.affected_rows()
    }
}

/// Runs merges for one named pipeline against its change feed and watermark.
///
/// Callers must not run the same pipeline name concurrently; different
/// pipelines share nothing but the stores.
pub struct Rollup<'a> {
    name: String,
    feed: &'a dyn ChangeFeed,
    store: &'a dyn WatermarkStore,
}

impl<'a> Rollup<'a> {
    pub fn new(name: &str, feed: &'a dyn ChangeFeed, store: &'a dyn WatermarkStore) -> Self {
        Self {
            name: name.to_string(),
            feed,
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current watermark of the pipeline (version 0 if it never ran).
    pub async fn watermark(&self) -> Result<Watermark> {
        self.store
            .get_or_create(&self.name)
            .await
            .map_err(|source| RollupError::WatermarkRead {
                pipeline: self.name.clone(),
                source,
            })
    }

    /// Whether the feed reports anything after the current watermark.
    pub async fn has_changes(&self) -> Result<bool> {
        let result = async {
            let watermark = self.watermark().await?;
            self.feed
                .has_changes_since(watermark.version)
                .await
                .map_err(|source| RollupError::Precheck {
                    pipeline: self.name.clone(),
                    source,
                })
        }
        .await;

        if let Err(ref e) = result {
            tracing::error!("Change check failed for pipeline '{}': {:?}", self.name, e);
        }
        result
    }

    /// Merge everything after the stored watermark and advance it.
    ///
    /// The watermark is saved only after `merge` succeeds. A failed merge
    /// leaves it untouched, so a retry reprocesses the same range.
    pub async fn run(&self, merge: &dyn MergeLogic) -> Result<RunResult> {
        let result = self.run_inner(merge).await;
        if let Err(ref e) = result {
            tracing::error!("Rollup '{}' failed: {:?}", self.name, e);
            if e.has_partial_effects() {
                tracing::warn!(
                    "Rollup '{}' left unrecorded changes behind; the next run reprocesses them",
                    self.name
                );
            }
        }
        result
    }

    async fn run_inner(&self, merge: &dyn MergeLogic) -> Result<RunResult> {
        let started = Instant::now();
        let mut watermark = self.watermark().await?;
        let since_version = watermark.version;

        // Captured before any change query runs.
        let as_of = self
            .feed
            .current_sequence_number()
            .await
            .map_err(|source| RollupError::SequenceCapture {
                pipeline: self.name.clone(),
                source,
            })?;
        if as_of < since_version {
            return Err(RollupError::SequenceRegressed {
                pipeline: self.name.clone(),
                stored: since_version,
                current: as_of,
            });
        }

        tracing::info!(
            "Running rollup '{}' ({}) from version {} as of {}",
            self.name,
            merge.name(),
            since_version,
            as_of
        );

        let stats = merge
            .merge_since(since_version)
            .await
            .map_err(|source| RollupError::Merge {
                pipeline: self.name.clone(),
                source: Box::new(source),
            })?;

        watermark.advance(as_of);
        self.store
            .save(&watermark)
            .await
            .map_err(|source| RollupError::WatermarkSave {
                pipeline: self.name.clone(),
                version: watermark.version,
                source,
            })?;

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            "Rollup '{}' complete: {} rows affected, watermark {} -> {} ({}ms)",
            self.name,
            stats.affected_rows(),
            since_version,
            watermark.version,
            duration_ms
        );

        Ok(RunResult {
            pipeline: self.name.clone(),
            since_version,
            as_of_version: watermark.version,
            stats,
            duration_ms,
            last_sync_utc: watermark.last_sync_utc,
        })
    }
}
