// ABOUTME: TOML configuration - database URLs, change log, watermark backend, pipelines, checks
// ABOUTME: Loaded once at startup and validated before anything connects

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::postgres::change_feed::DEFAULT_LOG_TABLE;
use crate::postgres::sql_table::{SqlStrategy, KEYS_PLACEHOLDER};
use crate::postgres::watermark::DEFAULT_WATERMARK_TABLE;
use crate::rollup::bulk::DEFAULT_CHUNK_SIZE;
use crate::rollup::schema::{Column, TableSchema};
use crate::rollup::watermark::FileWatermarkStore;
use crate::utils::{validate_identifier, validate_table_name};

/// Default configuration file name.
pub const DEFAULT_CONFIG_PATH: &str = "rollup.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RollupConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub change_feed: ChangeFeedConfig,
    #[serde(default)]
    pub watermarks: WatermarkConfig,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub source_url: Option<String>,
    /// Database holding the rollup tables; defaults to the source
    pub target_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChangeFeedConfig {
    #[serde(default = "default_log_table")]
    pub log_table: String,
}

impl Default for ChangeFeedConfig {
    fn default() -> Self {
        Self {
            log_table: default_log_table(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkBackend {
    #[default]
    Postgres,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatermarkConfig {
    #[serde(default)]
    pub backend: WatermarkBackend,
    /// Table used by the postgres backend (in the target database)
    #[serde(default = "default_watermark_table")]
    pub table: String,
    /// File used by the file backend
    #[serde(default = "FileWatermarkStore::default_path")]
    pub path: PathBuf,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            backend: WatermarkBackend::default(),
            table: default_watermark_table(),
            path: FileWatermarkStore::default_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Merge all tables of a run inside one target transaction
    #[serde(default)]
    pub atomic: bool,
    /// Source tables whose changes this pipeline consumes (empty means any)
    #[serde(default)]
    pub tracked_tables: Vec<String>,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    SinglePhase,
    TwoPhase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub table: String,
    pub strategy: Strategy,
    pub identity_column: Option<String>,
    pub key: Vec<Column>,
    #[serde(default)]
    pub facts: Vec<Column>,
    pub change_query: Option<String>,
    pub key_query: Option<String>,
    pub rollup_query: Option<String>,
}

impl TableConfig {
    pub fn schema(&self) -> TableSchema {
        let schema = TableSchema::new(self.table.clone())
            .with_columns(self.key.clone(), self.facts.clone());
        match &self.identity_column {
            Some(identity) => schema.identity(identity.clone()),
            None => schema,
        }
    }

    pub fn sql_strategy(&self) -> Result<SqlStrategy> {
        match self.strategy {
            Strategy::SinglePhase => {
                let Some(change_query) = &self.change_query else {
                    bail!("Table {} uses single-phase but has no change_query", self.table);
                };
                Ok(SqlStrategy::SinglePhase {
                    change_query: change_query.clone(),
                })
            }
            Strategy::TwoPhase => {
                let (Some(key_query), Some(rollup_query)) = (&self.key_query, &self.rollup_query)
                else {
                    bail!(
                        "Table {} uses two-phase but needs both key_query and rollup_query",
                        self.table
                    );
                };
                if !rollup_query.contains(KEYS_PLACEHOLDER) {
                    bail!(
                        "rollup_query for {} must contain the {} placeholder",
                        self.table,
                        KEYS_PLACEHOLDER
                    );
                }
                Ok(SqlStrategy::TwoPhase {
                    key_query: key_query.clone(),
                    rollup_query: rollup_query.clone(),
                })
            }
        }
    }
}

/// A consistency check between a live aggregation and a rollup table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckConfig {
    pub name: String,
    pub key: Vec<Column>,
    pub facts: Vec<Column>,
    /// Runs on the source database
    pub source_query: String,
    /// Runs on the target database
    pub rollup_query: String,
    /// Fact compared by `validate`; defaults to the first fact
    pub fact: Option<String>,
}

impl CheckConfig {
    pub fn schema(&self) -> TableSchema {
        TableSchema::new(self.name.clone()).with_columns(self.key.clone(), self.facts.clone())
    }

    /// Position of the validated fact among `facts`.
    pub fn fact_index(&self) -> Result<usize> {
        match &self.fact {
            Some(name) => self
                .facts
                .iter()
                .position(|c| &c.name == name)
                .with_context(|| format!("Check {} has no fact named '{}'", self.name, name)),
            None if self.facts.is_empty() => bail!("Check {} declares no facts", self.name),
            None => Ok(0),
        }
    }
}

fn default_log_table() -> String {
    DEFAULT_LOG_TABLE.to_string()
}

fn default_watermark_table() -> String {
    DEFAULT_WATERMARK_TABLE.to_string()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl RollupConfig {
    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = Self::parse(&contents)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        tracing::debug!(
            "Loaded {} pipelines and {} checks from {:?}",
            config.pipelines.len(),
            config.checks.len(),
            path
        );
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: RollupConfig = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the configured URLs with those given on the command line.
    pub fn with_urls(mut self, source_url: Option<String>, target_url: Option<String>) -> Self {
        if source_url.is_some() {
            self.database.source_url = source_url;
        }
        if target_url.is_some() {
            self.database.target_url = target_url;
        }
        self
    }

    pub fn source_url(&self) -> Result<&str> {
        self.database.source_url.as_deref().context(
            "Source database URL not configured. Set [database] source_url, --source or ROLLUP_SOURCE_URL",
        )
    }

    pub fn target_url(&self) -> Result<&str> {
        match &self.database.target_url {
            Some(url) => Ok(url),
            None => self.source_url(),
        }
    }

    pub fn pipeline(&self, name: &str) -> Result<&PipelineConfig> {
        self.pipelines
            .iter()
            .find(|p| p.name == name)
            .with_context(|| format!("No pipeline named '{}' in config", name))
    }

    pub fn check(&self, name: &str) -> Result<&CheckConfig> {
        self.checks
            .iter()
            .find(|c| c.name == name)
            .with_context(|| format!("No check named '{}' in config", name))
    }

    /// Pipelines selected by an optional name filter.
    pub fn select_pipelines(&self, name: Option<&str>) -> Result<Vec<&PipelineConfig>> {
        match name {
            Some(name) => Ok(vec![self.pipeline(name)?]),
            None => Ok(self.pipelines.iter().collect()),
        }
    }

    /// Checks selected by an optional name filter.
    pub fn select_checks(&self, name: Option<&str>) -> Result<Vec<&CheckConfig>> {
        match name {
            Some(name) => Ok(vec![self.check(name)?]),
            None => Ok(self.checks.iter().collect()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_table_name(&self.change_feed.log_table)
            .context("Invalid [change_feed] log_table")?;
        validate_table_name(&self.watermarks.table).context("Invalid [watermarks] table")?;

        let mut names = HashSet::new();
        for pipeline in &self.pipelines {
            validate_identifier(&pipeline.name).context("Invalid pipeline name")?;
            if !names.insert(pipeline.name.as_str()) {
                bail!("Pipeline '{}' is defined more than once", pipeline.name);
            }
            if pipeline.chunk_size == 0 {
                bail!("Pipeline '{}' chunk_size must be at least 1", pipeline.name);
            }
            if pipeline.tables.is_empty() {
                bail!("Pipeline '{}' has no tables", pipeline.name);
            }
            for table in &pipeline.tracked_tables {
                validate_table_name(table).with_context(|| {
                    format!("Invalid tracked table in pipeline '{}'", pipeline.name)
                })?;
            }
            for table in &pipeline.tables {
                validate_table_name(&table.table)
                    .with_context(|| format!("Invalid table in pipeline '{}'", pipeline.name))?;
                validate_columns(&table.key, &table.facts)
                    .with_context(|| format!("Invalid columns for {}", table.table))?;
                if let Some(identity) = &table.identity_column {
                    validate_identifier(identity)
                        .with_context(|| format!("Invalid identity column for {}", table.table))?;
                }
                table.schema().validate()?;
                table.sql_strategy()?;
            }
        }

        let mut names = HashSet::new();
        for check in &self.checks {
            validate_identifier(&check.name).context("Invalid check name")?;
            if !names.insert(check.name.as_str()) {
                bail!("Check '{}' is defined more than once", check.name);
            }
            validate_columns(&check.key, &check.facts)
                .with_context(|| format!("Invalid columns for check {}", check.name))?;
            check.schema().validate()?;
            check.fact_index()?;
        }

        Ok(())
    }
}

fn validate_columns(key: &[Column], facts: &[Column]) -> Result<()> {
    for column in key.iter().chain(facts) {
        validate_identifier(&column.name)?;
    }
    Ok(())
}
