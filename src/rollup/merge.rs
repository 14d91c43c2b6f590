// ABOUTME: Table merge units - replace the rollup rows of every key touched since a version
// ABOUTME: Single-phase (aggregated change query) and two-phase (keys, then re-aggregate)

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::hash::Hash;
use std::ops::AddAssign;

use super::bulk::{BulkSink, BulkTransfer, DEFAULT_CHUNK_SIZE};
use super::schema::TableSchema;
use super::value::RowValues;
use crate::error::RollupError;

/// Row counts of one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Distinct keys touched since the watermark
    pub keys: u64,
    /// Stale rollup rows removed
    pub rows_deleted: u64,
    /// Freshly aggregated rows written
    pub rows_inserted: u64,
}

impl MergeStats {
    /// Rows recomputed by the merge. Replace semantics recompute every
    /// touched key, so re-running a range reports the same count again.
    pub fn affected_rows(&self) -> u64 {
        self.rows_inserted
    }
}

impl AddAssign for MergeStats {
    fn add_assign(&mut self, other: Self) {
        self.keys += other.keys;
        self.rows_deleted += other.rows_deleted;
        self.rows_inserted += other.rows_inserted;
    }
}

/// Work the orchestrator runs between reading and advancing a watermark.
///
/// Must apply every change after `since_version` or fail; it may be re-run
/// over the same range any number of times.
#[async_trait]
pub trait MergeLogic: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    async fn merge_since(&self, since_version: i64) -> Result<MergeStats, RollupError>;
}

/// Change query for the single-phase strategy: returns fully aggregated rows
/// for every key touched since the version.
#[async_trait]
pub trait ChangeQuery: Send + Sync {
    type Row: RowValues + Send + Sync;
    type Key: RowValues + Clone + Eq + Hash + Send + Sync;

    fn schema(&self) -> &TableSchema;

    /// Projection of a row onto its rollup key.
    fn key_of(&self, row: &Self::Row) -> Self::Key;

    async fn query_changes(&self, since_version: i64) -> Result<Vec<Self::Row>>;
}

/// Queries for the two-phase strategy.
///
/// Needed whenever a changed detail row must recompute its whole group: the
/// first query finds touched keys, the second aggregates those keys over the
/// full source rather than over the changed rows only.
#[async_trait]
pub trait KeyChangeQuery: Send + Sync {
    type Row: RowValues + Send + Sync;
    type Key: RowValues + Clone + Eq + Hash + Send + Sync;

    fn schema(&self) -> &TableSchema;

    async fn query_changed_keys(&self, since_version: i64) -> Result<Vec<Self::Key>>;

    /// Aggregate rows for exactly `keys`. Keys whose group no longer has
    /// detail rows are simply absent from the result.
    async fn query_rollup_rows(&self, keys: &[Self::Key]) -> Result<Vec<Self::Row>>;
}

fn distinct<K: Clone + Eq + Hash>(keys: impl IntoIterator<Item = K>) -> Vec<K> {
    let mut seen = HashSet::new();
    keys.into_iter()
        .filter(|key| seen.insert(key.clone()))
        .collect()
}

/// Delete every touched key, then insert the fresh rows.
async fn replace<S, K, R>(
    sink: &S,
    chunk_size: usize,
    schema: &TableSchema,
    keys: &[K],
    rows: &[R],
) -> Result<MergeStats, RollupError>
where
    S: BulkSink + ?Sized,
    K: RowValues,
    R: RowValues,
{
    if keys.is_empty() {
        tracing::debug!("No changes for {}", schema.table());
        return Ok(MergeStats::default());
    }

    let transfer = BulkTransfer::new(sink).with_chunk_size(chunk_size);
    let rows_deleted = transfer.delete_many(schema, keys).await?;
    let rows_inserted = transfer
        .insert_many(schema, rows)
        .await
        .map_err(|e| e.after_applied(schema.table(), rows_deleted))?;

    tracing::info!(
        "Merged {}: {} keys, {} rows deleted, {} rows inserted",
        schema.table(),
        keys.len(),
        rows_deleted,
        rows_inserted
    );

    Ok(MergeStats {
        keys: keys.len() as u64,
        rows_deleted,
        rows_inserted,
    })
}

/// Merge unit whose change query already aggregates.
pub struct SinglePhaseMerge<'a, Q, S: ?Sized> {
    query: Q,
    sink: &'a S,
    chunk_size: usize,
}

impl<'a, Q: ChangeQuery, S: BulkSink + ?Sized> SinglePhaseMerge<'a, Q, S> {
    pub fn new(query: Q, sink: &'a S) -> Self {
        Self {
            query,
            sink,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

#[async_trait]
impl<'a, Q: ChangeQuery, S: BulkSink + ?Sized> MergeLogic for SinglePhaseMerge<'a, Q, S> {
    fn name(&self) -> &str {
        self.query.schema().table()
    }

    async fn merge_since(&self, since_version: i64) -> Result<MergeStats, RollupError> {
        let schema = self.query.schema();
        let rows = self
            .query
            .query_changes(since_version)
            .await
            .map_err(|source| RollupError::ChangeQuery {
                table: schema.table().to_string(),
                source,
            })?;

        let keys = distinct(rows.iter().map(|row| self.query.key_of(row)));
        replace(self.sink, self.chunk_size, schema, &keys, &rows).await
    }
}

/// Merge unit that finds touched keys first and re-aggregates them.
pub struct TwoPhaseMerge<'a, Q, S: ?Sized> {
    query: Q,
    sink: &'a S,
    chunk_size: usize,
}

impl<'a, Q: KeyChangeQuery, S: BulkSink + ?Sized> TwoPhaseMerge<'a, Q, S> {
    pub fn new(query: Q, sink: &'a S) -> Self {
        Self {
            query,
            sink,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

#[async_trait]
impl<'a, Q: KeyChangeQuery, S: BulkSink + ?Sized> MergeLogic for TwoPhaseMerge<'a, Q, S> {
    fn name(&self) -> &str {
        self.query.schema().table()
    }

    async fn merge_since(&self, since_version: i64) -> Result<MergeStats, RollupError> {
        let schema = self.query.schema();
        let change_error = |source: anyhow::Error| RollupError::ChangeQuery {
            table: schema.table().to_string(),
            source,
        };

        let keys = distinct(
            self.query
                .query_changed_keys(since_version)
                .await
                .map_err(change_error)?,
        );
        if keys.is_empty() {
            tracing::debug!("No changed keys for {}", schema.table());
            return Ok(MergeStats::default());
        }

        let rows = self
            .query
            .query_rollup_rows(&keys)
            .await
            .map_err(change_error)?;

        replace(self.sink, self.chunk_size, schema, &keys, &rows).await
    }
}

/// Several merge units run in order as one pipeline step.
///
/// The first failure stops the set; units merged before it stay merged and
/// their rows are counted into the error.
pub struct MergeSet<'a> {
    name: String,
    units: Vec<Box<dyn MergeLogic + 'a>>,
}

impl<'a> MergeSet<'a> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            units: Vec::new(),
        }
    }

    pub fn push(&mut self, unit: impl MergeLogic + 'a) {
        self.units.push(Box::new(unit));
    }

    pub fn with(mut self, unit: impl MergeLogic + 'a) -> Self {
        self.push(unit);
        self
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[async_trait]
impl<'a> MergeLogic for MergeSet<'a> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn merge_since(&self, since_version: i64) -> Result<MergeStats, RollupError> {
        let mut total = MergeStats::default();
        for unit in &self.units {
            let applied = total.rows_deleted + total.rows_inserted;
            total += unit
                .merge_since(since_version)
                .await
                .map_err(|e| e.after_applied(&self.name, applied))?;
        }
        Ok(total)
    }
}
