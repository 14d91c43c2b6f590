// ABOUTME: Watermark store backed by a PostgreSQL table
// ABOUTME: One row per pipeline, upserted after each successful run

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_postgres::{Client, Row};

use crate::rollup::watermark::{Watermark, WatermarkStore};
use crate::utils::{quote_qualified, validate_table_name};

/// Default watermark table.
pub const DEFAULT_WATERMARK_TABLE: &str = "public.rollup_watermark";

pub struct PgWatermarkStore<'a> {
    client: &'a Client,
    table: String,
}

impl<'a> PgWatermarkStore<'a> {
    pub fn new(client: &'a Client, table: &str) -> Result<Self> {
        validate_table_name(table).context("Invalid watermark table name")?;
        Ok(Self {
            client,
            table: table.to_string(),
        })
    }

    /// Create the watermark table if missing.
    pub async fn ensure_table(&self) -> Result<()> {
        let query = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                name text PRIMARY KEY,
                version bigint NOT NULL DEFAULT 0,
                last_sync_utc timestamptz
            )",
            quote_qualified(&self.table)
        );
        self.client
            .batch_execute(&query)
            .await
            .with_context(|| format!("Failed to create watermark table {}", self.table))?;
        Ok(())
    }

    fn from_row(row: &Row) -> Result<Watermark> {
        Ok(Watermark {
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            last_sync_utc: row.try_get("last_sync_utc")?,
        })
    }
}

#[async_trait]
impl WatermarkStore for PgWatermarkStore<'_> {
    async fn get_or_create(&self, name: &str) -> Result<Watermark> {
        let query = format!(
            "SELECT name, version, last_sync_utc FROM {} WHERE name = $1",
            quote_qualified(&self.table)
        );
        let row = self
            .client
            .query_opt(&query, &[&name])
            .await
            .with_context(|| format!("Failed to read watermark '{}' from {}", name, self.table))?;

        match row {
            Some(row) => Self::from_row(&row),
            None => {
                tracing::debug!("No watermark for '{}', starting from the beginning", name);
                Ok(Watermark::new(name))
            }
        }
    }

    async fn save(&self, watermark: &Watermark) -> Result<()> {
        // GREATEST keeps the stored version from moving backward.
        let query = format!(
            "INSERT INTO {table} (name, version, last_sync_utc) VALUES ($1, $2, $3)
             ON CONFLICT (name) DO UPDATE SET
                version = GREATEST({table}.version, EXCLUDED.version),
                last_sync_utc = EXCLUDED.last_sync_utc",
            table = quote_qualified(&self.table)
        );
        self.client
            .execute(
                &query,
                &[&watermark.name, &watermark.version, &watermark.last_sync_utc],
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to save watermark '{}' at version {}",
                    watermark.name, watermark.version
                )
            })?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Watermark>> {
        let query = format!(
            "SELECT name, version, last_sync_utc FROM {} ORDER BY name",
            quote_qualified(&self.table)
        );
        let rows = self
            .client
            .query(&query, &[])
            .await
            .with_context(|| format!("Failed to list watermarks from {}", self.table))?;
        rows.iter().map(Self::from_row).collect()
    }
}
