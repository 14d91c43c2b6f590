// ABOUTME: Bulk sink writing rollup chunks to PostgreSQL with one statement per chunk
// ABOUTME: Also provides AtomicMerge, which wraps a merge in a target-side transaction

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use crate::error::RollupError;
use crate::rollup::bulk::BulkSink;
use crate::rollup::merge::{MergeLogic, MergeStats};
use crate::rollup::schema::{Column, TableSchema};
use crate::rollup::value::Value;
use crate::utils::quote_ident;

/// PostgreSQL's limit on bind parameters per statement.
const MAX_PARAMS: usize = 65_535;

/// Bulk sink issuing one parameterised DELETE or INSERT per chunk.
///
/// Columns come only from the declared schema, never from the data.
pub struct PgBulkSink<'a> {
    client: &'a Client,
}

impl<'a> PgBulkSink<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        self.client
    }
}

#[async_trait]
impl BulkSink for PgBulkSink<'_> {
    async fn delete_chunk(&self, schema: &TableSchema, keys: &[Vec<Value>]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let key_columns: Vec<&Column> = schema.key_columns().iter().collect();
        let params = bind_params(&key_columns, keys)
            .with_context(|| format!("Invalid key for {}", schema.table()))?;

        let null_safe = keys.iter().flatten().any(Value::is_null);
        let query = build_delete_query(schema, keys.len(), null_safe);
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|v| v.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let deleted = self
            .client
            .execute(&query, &refs)
            .await
            .with_context(|| format!("Failed to delete rollup rows from {}", schema.table()))?;
        Ok(deleted)
    }

    async fn insert_chunk(&self, schema: &TableSchema, rows: &[Vec<Value>]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let columns = schema.insert_columns();
        let params = bind_params(&columns, rows)
            .with_context(|| format!("Invalid row for {}", schema.table()))?;

        let query = build_insert_query(schema, rows.len());
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|v| v.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let inserted = self
            .client
            .execute(&query, &refs)
            .await
            .with_context(|| format!("Failed to insert rollup rows into {}", schema.table()))?;
        Ok(inserted)
    }
}

/// Convert tuples to parameters typed by their columns, row-major.
fn bind_params(
    columns: &[&Column],
    tuples: &[Vec<Value>],
) -> Result<Vec<Box<dyn ToSql + Sync + Send>>> {
    if columns.len() * tuples.len() > MAX_PARAMS {
        bail!(
            "Chunk of {} tuples with {} columns exceeds {} parameters; use a smaller chunk size",
            tuples.len(),
            columns.len(),
            MAX_PARAMS
        );
    }

    let mut params = Vec::with_capacity(columns.len() * tuples.len());
    for tuple in tuples {
        if tuple.len() != columns.len() {
            bail!(
                "Expected {} values but got {}",
                columns.len(),
                tuple.len()
            );
        }
        for (column, value) in columns.iter().zip(tuple) {
            params.push(
                value
                    .to_param(column.column_type)
                    .with_context(|| format!("Column '{}'", column.name))?,
            );
        }
    }
    Ok(params)
}

fn placeholder_rows(num_rows: usize, num_cols: usize) -> Vec<String> {
    (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_cols)
                .map(|col_idx| format!("${}", row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect()
}

/// Build a delete of every row whose key equals one of `num_keys` keys.
///
/// Single-column key:
/// ```sql
/// DELETE FROM "schema"."table" WHERE "k" IN ($1, $2, ...)
/// ```
///
/// Composite key:
/// ```sql
/// DELETE FROM "schema"."table" WHERE ("k1", "k2") IN (($1, $2), ($3, $4), ...)
/// ```
///
/// With `null_safe`, each key is matched with `IS NOT DISTINCT FROM` so NULL
/// dimension values match too.
fn build_delete_query(schema: &TableSchema, num_keys: usize, null_safe: bool) -> String {
    let key_cols: Vec<String> = schema
        .key_columns()
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect();
    let num_key_cols = key_cols.len();

    let predicate = if null_safe {
        let disjuncts: Vec<String> = (0..num_keys)
            .map(|row_idx| {
                let conjuncts: Vec<String> = key_cols
                    .iter()
                    .enumerate()
                    .map(|(col_idx, col)| {
                        format!(
                            "{} IS NOT DISTINCT FROM ${}",
                            col,
                            row_idx * num_key_cols + col_idx + 1
                        )
                    })
                    .collect();
                format!("({})", conjuncts.join(" AND "))
            })
            .collect();
        disjuncts.join(" OR ")
    } else if num_key_cols == 1 {
        let placeholders: Vec<String> = (1..=num_keys).map(|i| format!("${}", i)).collect();
        format!("{} IN ({})", key_cols[0], placeholders.join(", "))
    } else {
        format!(
            "({}) IN ({})",
            key_cols.join(", "),
            placeholder_rows(num_keys, num_key_cols).join(", ")
        )
    };

    format!(
        "DELETE FROM {} WHERE {}",
        schema.qualified_table(),
        predicate
    )
}

/// Build a multi-row insert of the schema's insert columns.
///
/// ```sql
/// INSERT INTO "schema"."table" ("k1", "k2", "f1") VALUES ($1, $2, $3), ($4, $5, $6), ...
/// ```
fn build_insert_query(schema: &TableSchema, num_rows: usize) -> String {
    let columns = schema.insert_columns();
    let quoted_columns: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        schema.qualified_table(),
        quoted_columns.join(", "),
        placeholder_rows(num_rows, columns.len()).join(", ")
    )
}

/// Runs a merge inside one transaction on the target connection.
///
/// The wrapped merge must write through the same `client` (for example via a
/// [`PgBulkSink`] over it) and nothing else may use the client meanwhile.
/// A failed merge is rolled back, so no chunk stays applied.
pub struct AtomicMerge<'a, M> {
    client: &'a Client,
    inner: M,
}

impl<'a, M: MergeLogic> AtomicMerge<'a, M> {
    pub fn new(client: &'a Client, inner: M) -> Self {
        Self { client, inner }
    }

    fn transaction_error(&self, operation: &'static str, source: tokio_postgres::Error) -> RollupError {
        RollupError::Transaction {
            name: self.inner.name().to_string(),
            operation,
            source: source.into(),
        }
    }
}

#[async_trait]
impl<M: MergeLogic> MergeLogic for AtomicMerge<'_, M> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn merge_since(&self, since_version: i64) -> Result<MergeStats, RollupError> {
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| self.transaction_error("begin", e))?;

        match self.inner.merge_since(since_version).await {
            Ok(stats) => {
                self.client
                    .batch_execute("COMMIT")
                    .await
                    .map_err(|e| self.transaction_error("commit", e))?;
                Ok(stats)
            }
            Err(e) => {
                if let Err(rollback) = self.client.batch_execute("ROLLBACK").await {
                    tracing::warn!(
                        "Failed to roll back merge of {}: {}",
                        self.inner.name(),
                        rollback
                    );
                } else {
                    tracing::warn!("Rolled back merge of {}", self.inner.name());
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::schema::ColumnType;

    fn sales_schema() -> TableSchema {
        TableSchema::new("public.sales_rollup")
            .identity("id")
            .key("region", ColumnType::Text)
            .key("item_type", ColumnType::Text)
            .key("year", ColumnType::Int)
            .fact("total", ColumnType::Decimal)
    }

    #[test]
    fn test_build_delete_query_single_key() {
        let schema = TableSchema::new("totals").key("region", ColumnType::Text);
        let query = build_delete_query(&schema, 3, false);
        assert_eq!(
            query,
            "DELETE FROM \"totals\" WHERE \"region\" IN ($1, $2, $3)"
        );
    }

    #[test]
    fn test_build_delete_query_composite_key() {
        let query = build_delete_query(&sales_schema(), 2, false);
        assert!(query.contains("DELETE FROM \"public\".\"sales_rollup\""));
        assert!(query.contains("WHERE (\"region\", \"item_type\", \"year\") IN"));
        assert!(query.contains("($1, $2, $3), ($4, $5, $6)"));
    }

    #[test]
    fn test_build_delete_query_null_safe() {
        let schema = TableSchema::new("totals")
            .key("region", ColumnType::Text)
            .key("year", ColumnType::Int);
        let query = build_delete_query(&schema, 2, true);
        assert!(query.contains(
            "(\"region\" IS NOT DISTINCT FROM $1 AND \"year\" IS NOT DISTINCT FROM $2) OR (\"region\" IS NOT DISTINCT FROM $3"
        ));
    }

    #[test]
    fn test_build_insert_query_skips_identity() {
        let query = build_insert_query(&sales_schema(), 2);
        assert_eq!(
            query,
            "INSERT INTO \"public\".\"sales_rollup\" (\"region\", \"item_type\", \"year\", \"total\") \
             VALUES ($1, $2, $3, $4), ($5, $6, $7, $8)"
        );
    }

    #[test]
    fn test_bind_params_checks_width_and_types() {
        let schema = sales_schema();
        let columns = schema.insert_columns();

        let ok = bind_params(
            &columns,
            &[vec!["West".into(), "Widget".into(), 2024.into(), Value::Null]],
        );
        assert_eq!(ok.unwrap().len(), 4);

        let short = bind_params(&columns, &[vec!["West".into()]]);
        assert!(short.is_err());

        let wrong_type = bind_params(
            &columns,
            &[vec![2024.into(), "Widget".into(), 2024.into(), Value::Null]],
        );
        assert!(wrong_type.is_err());
    }

    #[test]
    fn test_bind_params_enforces_parameter_limit() {
        let column = Column::new("k", ColumnType::Int);
        let columns = vec![&column];
        let tuples: Vec<Vec<Value>> = (0..MAX_PARAMS as i32 + 1).map(|i| vec![i.into()]).collect();
        assert!(bind_params(&columns, &tuples).is_err());
    }
}
