// ABOUTME: Chunked set-based delete-by-key and insert-of-rows for rollup tables
// ABOUTME: Bounds each store round trip to a fixed number of keys or rows

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

use super::schema::TableSchema;
use super::value::{RowValues, Value};
use crate::error::RollupError;

/// Default number of keys or rows sent per store call.
pub const DEFAULT_CHUNK_SIZE: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOperation {
    Delete,
    Insert,
}

impl fmt::Display for BulkOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BulkOperation::Delete => f.write_str("delete"),
            BulkOperation::Insert => f.write_str("insert"),
        }
    }
}

/// Store side of the bulk transfer: one call per chunk.
///
/// Key tuples follow `schema.key_columns()`; row tuples follow
/// `schema.insert_columns()`.
#[async_trait]
pub trait BulkSink: Send + Sync {
    /// Delete every row whose composite key equals one of `keys`.
    /// Returns the number of rows deleted.
    async fn delete_chunk(&self, schema: &TableSchema, keys: &[Vec<Value>]) -> Result<u64>;

    /// Insert all `rows`. Returns the number of rows inserted.
    async fn insert_chunk(&self, schema: &TableSchema, rows: &[Vec<Value>]) -> Result<u64>;
}

/// Applies large deletes and inserts through a [`BulkSink`] in fixed-size chunks.
///
/// Holds no state between calls. A failing chunk aborts the call; chunks that
/// already succeeded stay applied, so callers needing atomicity must provide
/// an enclosing transaction (see [`crate::postgres::sink::AtomicMerge`]).
pub struct BulkTransfer<'a, S: ?Sized> {
    sink: &'a S,
    chunk_size: usize,
}

impl<'a, S: BulkSink + ?Sized> BulkTransfer<'a, S> {
    pub fn new(sink: &'a S) -> Self {
        Self {
            sink,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Use a different chunk size. Values below 1 are treated as 1.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Delete rows matching `keys`, chunk by chunk. Returns total rows deleted.
    pub async fn delete_many<K: RowValues>(
        &self,
        schema: &TableSchema,
        keys: &[K],
    ) -> Result<u64, RollupError> {
        let mut total_deleted = 0u64;

        for (index, chunk) in keys.chunks(self.chunk_size).enumerate() {
            let values: Vec<Vec<Value>> = chunk.iter().map(RowValues::row_values).collect();
            let deleted = self
                .sink
                .delete_chunk(schema, &values)
                .await
                .map_err(|source| RollupError::BulkTransfer {
                    table: schema.table().to_string(),
                    operation: BulkOperation::Delete,
                    chunk: index,
                    rows_applied: total_deleted,
                    source,
                })?;
            tracing::debug!(
                "Deleted {} rows from {} (chunk {}, {} keys)",
                deleted,
                schema.table(),
                index,
                chunk.len()
            );
            total_deleted += deleted;
        }

        Ok(total_deleted)
    }

    /// Insert `rows`, chunk by chunk. Returns total rows inserted.
    pub async fn insert_many<E: RowValues>(
        &self,
        schema: &TableSchema,
        rows: &[E],
    ) -> Result<u64, RollupError> {
        let mut total_inserted = 0u64;

        for (index, chunk) in rows.chunks(self.chunk_size).enumerate() {
            let values: Vec<Vec<Value>> = chunk.iter().map(RowValues::row_values).collect();
            let inserted = self
                .sink
                .insert_chunk(schema, &values)
                .await
                .map_err(|source| RollupError::BulkTransfer {
                    table: schema.table().to_string(),
                    operation: BulkOperation::Insert,
                    chunk: index,
                    rows_applied: total_inserted,
                    source,
                })?;
            tracing::debug!(
                "Inserted {} rows into {} (chunk {})",
                inserted,
                schema.table(),
                index
            );
            total_inserted += inserted;
        }

        Ok(total_inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::memory::MemorySink;
    use crate::rollup::schema::ColumnType;
    use crate::rollup::value::{RollupKey, RollupRow};

    fn schema() -> TableSchema {
        TableSchema::new("items")
            .identity("id")
            .key("name", ColumnType::Text)
            .fact("kind", ColumnType::Text)
    }

    fn items() -> Vec<RollupRow> {
        [
            ("whatever", "anything"),
            ("bogus", "johnson"),
            ("junebug", "thorium"),
            ("thalamus", "isthmus"),
            ("cropsie", "hydro"),
            ("thrombus", "julior"),
            ("horpkin", "vyle"),
            ("relly", "stanzig"),
        ]
        .iter()
        .map(|(name, kind)| {
            RollupRow::new(RollupKey::new(vec![(*name).into()]), vec![(*kind).into()])
        })
        .collect()
    }

    #[tokio::test]
    async fn test_insert_then_delete_many() {
        let sink = MemorySink::new();
        let schema = schema();
        let rows = items();
        let transfer = BulkTransfer::new(&sink);

        let inserted = transfer.insert_many(&schema, &rows).await.unwrap();
        assert_eq!(inserted, rows.len() as u64);

        let keys: Vec<RollupKey> = rows.iter().map(|r| r.key().clone()).collect();
        let deleted = transfer.delete_many(&schema, &keys).await.unwrap();
        assert_eq!(deleted, rows.len() as u64);
        assert!(sink.rows("items").is_empty());
    }

    #[tokio::test]
    async fn test_chunking_does_not_change_results() {
        let schema = schema();
        let rows = items();
        let doomed: Vec<RollupKey> = rows.iter().take(5).map(|r| r.key().clone()).collect();

        let mut outcomes = Vec::new();
        for chunk_size in [1, 2, 3, 7, 8, 30] {
            let sink = MemorySink::new();
            let transfer = BulkTransfer::new(&sink).with_chunk_size(chunk_size);
            let inserted = transfer.insert_many(&schema, &rows).await.unwrap();
            let deleted = transfer.delete_many(&schema, &doomed).await.unwrap();

            let expected_calls =
                rows.len().div_ceil(chunk_size) + doomed.len().div_ceil(chunk_size);
            assert_eq!(sink.call_count(), expected_calls);

            let mut remaining = sink.rows("items");
            remaining.sort();
            outcomes.push((inserted, deleted, remaining));
        }

        assert!(outcomes.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(outcomes[0].0, 8);
        assert_eq!(outcomes[0].1, 5);
        assert_eq!(outcomes[0].2.len(), 3);
    }

    #[tokio::test]
    async fn test_zero_chunk_size_is_clamped() {
        let sink = MemorySink::new();
        let transfer = BulkTransfer::new(&sink).with_chunk_size(0);
        assert_eq!(transfer.chunk_size(), 1);
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_calls() {
        let sink = MemorySink::new();
        let transfer = BulkTransfer::new(&sink);
        let keys: Vec<RollupKey> = Vec::new();
        assert_eq!(transfer.delete_many(&schema(), &keys).await.unwrap(), 0);
        assert_eq!(sink.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_chunk_aborts_without_rollback() {
        let sink = MemorySink::new();
        sink.fail_on_call(3);
        let schema = schema();
        let rows = items();
        let transfer = BulkTransfer::new(&sink).with_chunk_size(3);

        let err = transfer.insert_many(&schema, &rows).await.unwrap_err();
        match err {
            RollupError::BulkTransfer {
                operation,
                chunk,
                rows_applied,
                ..
            } => {
                assert_eq!(operation, BulkOperation::Insert);
                assert_eq!(chunk, 2);
                assert_eq!(rows_applied, 6);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Earlier chunks stay applied.
        assert_eq!(sink.rows("items").len(), 6);
    }
}
