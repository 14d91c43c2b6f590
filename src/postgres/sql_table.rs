// ABOUTME: Config-driven merge sources running user SQL against the source database
// ABOUTME: Single-phase change queries, or key queries plus a keyed re-aggregation

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio_postgres::Client;

use crate::rollup::merge::{ChangeQuery, KeyChangeQuery};
use crate::rollup::schema::{Column, TableSchema};
use crate::rollup::value::{RollupKey, RollupRow};
use crate::utils::quote_ident;

/// Placeholder in a two-phase rollup query that receives the key set.
pub const KEYS_PLACEHOLDER: &str = "{keys}";

/// How a rollup table finds its changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlStrategy {
    /// `change_query` returns aggregated rows for keys changed after `$1`.
    SinglePhase { change_query: String },
    /// `key_query` returns keys changed after `$1`; `rollup_query` aggregates
    /// the full source for the keys bound at [`KEYS_PLACEHOLDER`].
    TwoPhase {
        key_query: String,
        rollup_query: String,
    },
}

/// One rollup table whose change and aggregation queries come from config.
///
/// Result columns are read by the declared key and fact column names.
pub struct SqlRollupTable<'a> {
    client: &'a Client,
    schema: TableSchema,
    strategy: SqlStrategy,
}

impl<'a> SqlRollupTable<'a> {
    pub fn new(client: &'a Client, schema: TableSchema, strategy: SqlStrategy) -> Result<Self> {
        schema.validate()?;
        if let SqlStrategy::TwoPhase { rollup_query, .. } = &strategy {
            if !rollup_query.contains(KEYS_PLACEHOLDER) {
                bail!(
                    "rollup_query for {} must contain the {} placeholder",
                    schema.table(),
                    KEYS_PLACEHOLDER
                );
            }
        }
        Ok(Self {
            client,
            schema,
            strategy,
        })
    }

    pub fn strategy(&self) -> &SqlStrategy {
        &self.strategy
    }

    fn wrong_strategy(&self, expected: &str) -> anyhow::Error {
        anyhow::anyhow!(
            "{} is not configured for the {} strategy",
            self.schema.table(),
            expected
        )
    }
}

#[async_trait]
impl ChangeQuery for SqlRollupTable<'_> {
    type Row = RollupRow;
    type Key = RollupKey;

    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn key_of(&self, row: &RollupRow) -> RollupKey {
        row.key().clone()
    }

    async fn query_changes(&self, since_version: i64) -> Result<Vec<RollupRow>> {
        let SqlStrategy::SinglePhase { change_query } = &self.strategy else {
            return Err(self.wrong_strategy("single-phase"));
        };
        let rows = self
            .client
            .query(change_query.as_str(), &[&since_version])
            .await
            .with_context(|| format!("Change query for {} failed", self.schema.table()))?;

        rows.iter()
            .map(|row| RollupRow::from_row(row, &self.schema))
            .collect()
    }
}

#[async_trait]
impl KeyChangeQuery for SqlRollupTable<'_> {
    type Row = RollupRow;
    type Key = RollupKey;

    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    async fn query_changed_keys(&self, since_version: i64) -> Result<Vec<RollupKey>> {
        let SqlStrategy::TwoPhase { key_query, .. } = &self.strategy else {
            return Err(self.wrong_strategy("two-phase"));
        };
        let rows = self
            .client
            .query(key_query.as_str(), &[&since_version])
            .await
            .with_context(|| format!("Key query for {} failed", self.schema.table()))?;

        rows.iter()
            .map(|row| RollupKey::from_row(row, &self.schema))
            .collect()
    }

    async fn query_rollup_rows(&self, keys: &[RollupKey]) -> Result<Vec<RollupRow>> {
        let SqlStrategy::TwoPhase { rollup_query, .. } = &self.strategy else {
            return Err(self.wrong_strategy("two-phase"));
        };
        let key_columns = self.schema.key_columns();
        let query = bind_key_set(rollup_query, key_columns);
        let key_set = serde_json::Value::Array(
            keys.iter()
                .map(|key| key.to_json(key_columns))
                .collect::<Result<Vec<_>>>()?,
        );

        let rows = self
            .client
            .query(query.as_str(), &[&key_set])
            .await
            .with_context(|| {
                format!(
                    "Rollup query for {} failed ({} keys)",
                    self.schema.table(),
                    keys.len()
                )
            })?;

        rows.iter()
            .map(|row| RollupRow::from_row(row, &self.schema))
            .collect()
    }
}

/// Replace [`KEYS_PLACEHOLDER`] with a row source over the JSON key set in `$1`.
///
/// ```text
/// jsonb_to_recordset($1::jsonb) AS keys("region" text, "year" integer)
/// ```
pub fn bind_key_set(rollup_query: &str, key_columns: &[Column]) -> String {
    let definitions: Vec<String> = key_columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.column_type.sql_type()))
        .collect();
    let source = format!(
        "jsonb_to_recordset($1::jsonb) AS keys({})",
        definitions.join(", ")
    );
    rollup_query.replace(KEYS_PLACEHOLDER, &source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::schema::ColumnType;

    #[test]
    fn test_bind_key_set() {
        let columns = vec![
            Column::new("region", ColumnType::Text),
            Column::new("year", ColumnType::Int),
        ];
        let query = bind_key_set(
            "SELECT s.region, s.year, sum(s.price) AS total FROM sales s \
             JOIN {keys} ON keys.region = s.region AND keys.year = s.year GROUP BY 1, 2",
            &columns,
        );
        assert!(query.contains(
            "JOIN jsonb_to_recordset($1::jsonb) AS keys(\"region\" text, \"year\" integer) ON"
        ));
        assert!(!query.contains(KEYS_PLACEHOLDER));
    }
}
