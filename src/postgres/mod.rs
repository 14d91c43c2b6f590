// ABOUTME: PostgreSQL bindings of the rollup collaborators
// ABOUTME: Change capture, watermark table, bulk sink and config-driven SQL sources

pub mod change_feed;
pub mod connection;
pub mod sink;
pub mod snapshot;
pub mod sql_table;
pub mod watermark;

pub use change_feed::{ChangeRecord, PgChangeFeed};
pub use connection::{connect, connect_with_retry, init_tls_policy};
pub use sink::{AtomicMerge, PgBulkSink};
pub use snapshot::SqlSnapshot;
pub use sql_table::SqlRollupTable;
pub use watermark::PgWatermarkStore;
