// ABOUTME: Incremental rollup engine - watermarks, change feeds, merge strategies, bulk transfer
// ABOUTME: Also hosts the consistency tools (mismatch finder, totals validator) and the daemon

pub mod bulk;
pub mod daemon;
pub mod diff;
pub mod feed;
pub mod memory;
pub mod merge;
pub mod orchestrator;
pub mod schema;
pub mod validator;
pub mod value;
pub mod watermark;

pub use bulk::{BulkOperation, BulkSink, BulkTransfer, DEFAULT_CHUNK_SIZE};
pub use daemon::{CycleStats, DaemonConfig, PipelineSet, RollupDaemon};
pub use diff::{
    DiffResult, DimensionMismatch, FactMismatch, MismatchFinder, MismatchType, SnapshotSource,
};
pub use feed::ChangeFeed;
pub use memory::{MemoryChangeFeed, MemorySink, MemoryWatermarkStore};
pub use merge::{
    ChangeQuery, KeyChangeQuery, MergeLogic, MergeSet, MergeStats, SinglePhaseMerge,
    TwoPhaseMerge,
};
pub use orchestrator::{Rollup, RunResult};
pub use schema::{Column, ColumnType, TableSchema};
pub use validator::{TotalsMismatch, TotalsValidator, ValidationReport};
pub use value::{RollupKey, RollupRow, RowValues, Value};
pub use watermark::{FileWatermarkStore, Watermark, WatermarkStore};
