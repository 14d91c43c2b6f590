// ABOUTME: Change feed contract - sequence numbers and change detection since a version
// ABOUTME: Implemented by the Postgres change log and by the in-memory test feed

use anyhow::Result;
use async_trait::async_trait;

/// Source of monotonically increasing change sequence numbers.
///
/// "Changes since V" must include every modification whose commit sequence
/// number exceeds V. Queries for the actual changed rows or keys live in the
/// merge sources, which receive the watermark version as their parameter.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Highest sequence number up to which all changes are visible.
    ///
    /// Captured before the change queries of a run, so those queries can
    /// never race ahead of the watermark the run will record.
    async fn current_sequence_number(&self) -> Result<i64>;

    /// Whether anything changed after `since_version`.
    async fn has_changes_since(&self, since_version: i64) -> Result<bool>;
}
