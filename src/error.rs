// ABOUTME: Error type for the rollup write path (watermark, change query, bulk transfer)
// ABOUTME: Each variant carries the pipeline/table context needed to diagnose a failed run

use thiserror::Error;

use crate::rollup::bulk::BulkOperation;

pub type Result<T> = std::result::Result<T, RollupError>;

/// Failure of a rollup run or one of its steps.
///
/// Collaborator errors are kept as `anyhow::Error` sources so the full chain
/// is available when the error is logged with `{:?}`.
#[derive(Debug, Error)]
pub enum RollupError {
    #[error("failed to read watermark for pipeline '{pipeline}'")]
    WatermarkRead {
        pipeline: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to capture change feed sequence number for pipeline '{pipeline}'")]
    SequenceCapture {
        pipeline: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(
        "change feed sequence number {current} is behind watermark {stored} for pipeline '{pipeline}'"
    )]
    SequenceRegressed {
        pipeline: String,
        stored: i64,
        current: i64,
    },

    #[error("failed to check for changes for pipeline '{pipeline}'")]
    Precheck {
        pipeline: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("change query failed for {table}")]
    ChangeQuery {
        table: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("bulk {operation} failed for {table} at chunk {chunk} ({rows_applied} rows already applied)")]
    BulkTransfer {
        table: String,
        operation: BulkOperation,
        chunk: usize,
        rows_applied: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("transaction {operation} failed for {name}")]
    Transaction {
        name: String,
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{name} stopped after {rows_applied} rows were already applied")]
    Incomplete {
        name: String,
        rows_applied: u64,
        #[source]
        source: Box<RollupError>,
    },

    #[error("merge failed for pipeline '{pipeline}'")]
    Merge {
        pipeline: String,
        #[source]
        source: Box<RollupError>,
    },

    #[error("failed to save watermark version {version} for pipeline '{pipeline}'")]
    WatermarkSave {
        pipeline: String,
        version: i64,
        #[source]
        source: anyhow::Error,
    },
}

impl RollupError {
    /// Whether the merge may have left applied but unrecorded changes behind.
    ///
    /// True once the failing merge has written any row, and for watermark
    /// save failures. The next run reprocesses the same range either way.
    pub fn has_partial_effects(&self) -> bool {
        match self {
            RollupError::BulkTransfer { rows_applied, .. } => *rows_applied > 0,
            RollupError::Incomplete {
                rows_applied,
                source,
                ..
            } => *rows_applied > 0 || source.has_partial_effects(),
            RollupError::WatermarkSave { .. } => true,
            RollupError::Merge { source, .. } => source.has_partial_effects(),
            _ => false,
        }
    }

    /// Account for `rows` already applied by `name` before this error.
    ///
    /// Bulk failures add them to their own count; any other error is wrapped
    /// in [`RollupError::Incomplete`]. Zero rows leaves the error unchanged.
    pub fn after_applied(self, name: &str, rows: u64) -> Self {
        if rows == 0 {
            return self;
        }
        match self {
            RollupError::BulkTransfer {
                table,
                operation,
                chunk,
                rows_applied,
                source,
            } => RollupError::BulkTransfer {
                table,
                operation,
                chunk,
                rows_applied: rows_applied + rows,
                source,
            },
            other => RollupError::Incomplete {
                name: name.to_string(),
                rows_applied: rows,
                source: Box::new(other),
            },
        }
    }
}
