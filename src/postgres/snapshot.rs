// ABOUTME: Snapshot source running a live aggregation and a rollup read as plain SQL
// ABOUTME: Feeds the mismatch finder and totals validator from configured checks

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_postgres::Client;

use crate::rollup::diff::SnapshotSource;
use crate::rollup::schema::TableSchema;
use crate::rollup::value::RollupRow;

/// Both queries return the schema's key and fact columns by name.
pub struct SqlSnapshot<'a> {
    source: &'a Client,
    rollup: &'a Client,
    schema: TableSchema,
    source_query: String,
    rollup_query: String,
}

impl<'a> SqlSnapshot<'a> {
    /// `source_query` runs on `source`, `rollup_query` on `rollup`.
    pub fn new(
        source: &'a Client,
        rollup: &'a Client,
        schema: TableSchema,
        source_query: &str,
        rollup_query: &str,
    ) -> Self {
        Self {
            source,
            rollup,
            schema,
            source_query: source_query.to_string(),
            rollup_query: rollup_query.to_string(),
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    async fn fetch(&self, client: &Client, query: &str, side: &str) -> Result<Vec<RollupRow>> {
        let rows = client
            .query(query, &[])
            .await
            .with_context(|| format!("Failed to query {} snapshot for {}", side, self.schema.table()))?;
        let records = rows
            .iter()
            .map(|row| RollupRow::from_row(row, &self.schema))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(
            "Fetched {} {} rows for {}",
            records.len(),
            side,
            self.schema.table()
        );
        Ok(records)
    }
}

#[async_trait]
impl SnapshotSource for SqlSnapshot<'_> {
    type Record = RollupRow;

    async fn query_source(&self) -> Result<Vec<RollupRow>> {
        self.fetch(self.source, &self.source_query, "source").await
    }

    async fn query_rollup(&self) -> Result<Vec<RollupRow>> {
        self.fetch(self.rollup, &self.rollup_query, "rollup").await
    }
}
