// ABOUTME: Trigger-based change capture for PostgreSQL tables
// ABOUTME: Sequence numbers are 64-bit transaction ids taken from the current snapshot

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::Client;

use crate::rollup::feed::ChangeFeed;
use crate::utils::{quote_qualified, validate_table_name};

/// Default change log table.
pub const DEFAULT_LOG_TABLE: &str = "public.rollup_changes";

/// One captured row change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub change_id: i64,
    /// Transaction id of the change; compared against watermark versions
    pub sequence: i64,
    pub table_name: String,
    /// INSERT, UPDATE or DELETE
    pub op: String,
    pub old_row: Option<serde_json::Value>,
    pub new_row: Option<serde_json::Value>,
    pub changed_at: DateTime<Utc>,
}

/// Change feed over a log table written by row triggers.
///
/// Every captured change carries the 64-bit id of its writing transaction.
/// The current sequence number is one below the snapshot's xmin: all
/// transactions up to it have finished, so no change at or below a captured
/// sequence number can still appear later. Changes above it are picked up by
/// this run and again by the next, which replace semantics make harmless.
///
/// Requires PostgreSQL 13 or later (`xid8`).
pub struct PgChangeFeed<'a> {
    client: &'a Client,
    log_table: String,
    tables: Vec<String>,
}

impl<'a> PgChangeFeed<'a> {
    pub fn new(client: &'a Client, log_table: &str) -> Result<Self> {
        validate_table_name(log_table).context("Invalid change log table name")?;
        Ok(Self {
            client,
            log_table: log_table.to_string(),
            tables: Vec::new(),
        })
    }

    /// Restrict change detection to the given tables (empty means all).
    pub fn with_tables(mut self, tables: &[String]) -> Result<Self> {
        self.tables = tables
            .iter()
            .map(|table| -> Result<String> {
                validate_table_name(table)?;
                Ok(qualify(table))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self)
    }

    pub fn log_table(&self) -> &str {
        &self.log_table
    }

    /// Create the log table and capture function if missing.
    pub async fn install_log(&self) -> Result<()> {
        self.client
            .batch_execute(&build_install_log_sql(&self.log_table))
            .await
            .with_context(|| format!("Failed to create change log {}", self.log_table))?;
        tracing::info!("Change log {} is ready", self.log_table);
        Ok(())
    }

    /// Capture inserts, updates and deletes of `table` into the log.
    pub async fn install_tracking(&self, table: &str) -> Result<()> {
        validate_table_name(table)?;
        self.install_log().await?;
        self.client
            .batch_execute(&build_install_trigger_sql(&self.log_table, table))
            .await
            .with_context(|| format!("Failed to install change tracking on {}", table))?;
        tracing::info!("Change tracking installed on {}", qualify(table));
        Ok(())
    }

    /// Captured changes of `table` after `since_version`, oldest first.
    pub async fn changes_since(&self, table: &str, since_version: i64) -> Result<Vec<ChangeRecord>> {
        let query = format!(
            "SELECT change_id, change_xid::text::bigint, table_name, op, old_row, new_row, changed_at \
             FROM {} WHERE table_name = $1 AND {} ORDER BY change_id",
            quote_qualified(&self.log_table),
            xid_compare(">", 2)
        );
        let rows = self
            .client
            .query(&query, &[&qualify(table), &since_version])
            .await
            .with_context(|| format!("Failed to read changes of {}", table))?;

        rows.iter()
            .map(|row| -> Result<ChangeRecord> {
                Ok(ChangeRecord {
                    change_id: row.try_get(0)?,
                    sequence: row.try_get(1)?,
                    table_name: row.try_get(2)?,
                    op: row.try_get(3)?,
                    old_row: row.try_get(4)?,
                    new_row: row.try_get(5)?,
                    changed_at: row.try_get(6)?,
                })
            })
            .collect()
    }

    /// Delete log records at or below `up_to`. Returns the number removed.
    pub async fn prune(&self, up_to: i64) -> Result<u64> {
        let query = format!(
            "DELETE FROM {} WHERE {}",
            quote_qualified(&self.log_table),
            xid_compare("<=", 1)
        );
        let removed = self
            .client
            .execute(&query, &[&up_to])
            .await
            .with_context(|| format!("Failed to prune change log {}", self.log_table))?;
        tracing::info!(
            "Pruned {} change records at or below {} from {}",
            removed,
            up_to,
            self.log_table
        );
        Ok(removed)
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed<'_> {
    async fn current_sequence_number(&self) -> Result<i64> {
        let row = self
            .client
            .query_one(
                "SELECT pg_snapshot_xmin(pg_current_snapshot())::text::bigint - 1",
                &[],
            )
            .await
            .context("Failed to capture current transaction snapshot")?;
        Ok(row.get(0))
    }

    async fn has_changes_since(&self, since_version: i64) -> Result<bool> {
        let log = quote_qualified(&self.log_table);
        let result = if self.tables.is_empty() {
            let query = format!(
                "SELECT EXISTS (SELECT 1 FROM {} WHERE {})",
                log,
                xid_compare(">", 1)
            );
            self.client.query_one(&query, &[&since_version]).await
        } else {
            let query = format!(
                "SELECT EXISTS (SELECT 1 FROM {} WHERE {} AND table_name = ANY($2))",
                log,
                xid_compare(">", 1)
            );
            self.client
                .query_one(&query, &[&since_version, &self.tables])
                .await
        };
        let row = result.with_context(|| format!("Failed to check change log {}", self.log_table))?;
        Ok(row.get(0))
    }
}

/// `schema.table` form used in the log's table_name column.
pub fn qualify(table: &str) -> String {
    if table.contains('.') {
        table.to_string()
    } else {
        format!("public.{}", table)
    }
}

/// Compare `change_xid` with a bigint parameter.
///
/// The parameter is cast to xid8 rather than the column to bigint, so the
/// log's xid indexes stay usable.
fn xid_compare(op: &str, param: usize) -> String {
    format!("change_xid {} (${}::bigint)::text::xid8", op, param)
}

fn capture_function(log_table: &str) -> String {
    let qualified = qualify(log_table);
    let (schema, table) = qualified.split_once('.').unwrap_or(("public", qualified.as_str()));
    quote_qualified(&format!("{}.{}_capture", schema, table))
}

fn build_install_log_sql(log_table: &str) -> String {
    let log = quote_qualified(log_table);
    let prefix = qualify(log_table).replace('.', "_");
    let index = crate::utils::quote_ident(&format!("{}_xid_idx", prefix));
    let xid_index = crate::utils::quote_ident(&format!("{}_change_xid_idx", prefix));
    format!(
        "CREATE TABLE IF NOT EXISTS {log} (
            change_id bigserial PRIMARY KEY,
            change_xid xid8 NOT NULL DEFAULT pg_current_xact_id(),
            table_name text NOT NULL,
            op text NOT NULL,
            old_row jsonb,
            new_row jsonb,
            changed_at timestamptz NOT NULL DEFAULT now()
        );
        CREATE INDEX IF NOT EXISTS {index} ON {log} (table_name, change_xid);
        CREATE INDEX IF NOT EXISTS {xid_index} ON {log} (change_xid);
        CREATE OR REPLACE FUNCTION {function}() RETURNS trigger LANGUAGE plpgsql AS $rollup$
        BEGIN
            INSERT INTO {log} (table_name, op, old_row, new_row)
            VALUES (
                TG_TABLE_SCHEMA || '.' || TG_TABLE_NAME,
                TG_OP,
                CASE WHEN TG_OP IN ('UPDATE', 'DELETE') THEN to_jsonb(OLD) END,
                CASE WHEN TG_OP IN ('INSERT', 'UPDATE') THEN to_jsonb(NEW) END
            );
            RETURN NULL;
        END;
        $rollup$;",
        log = log,
        index = index,
        xid_index = xid_index,
        function = capture_function(log_table),
    )
}

fn build_install_trigger_sql(log_table: &str, table: &str) -> String {
    let target = quote_qualified(table);
    format!(
        "DROP TRIGGER IF EXISTS rollup_capture ON {target};
        CREATE TRIGGER rollup_capture AFTER INSERT OR UPDATE OR DELETE ON {target}
            FOR EACH ROW EXECUTE FUNCTION {function}();",
        target = target,
        function = capture_function(log_table),
    )
}
