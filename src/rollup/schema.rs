// ABOUTME: Declared column schema for rollup tables - which fields are stored and how
// ABOUTME: Replaces type reflection with an explicit key/fact column list per table

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::utils::quote_qualified;

/// Storable scalar column types.
///
/// Accepts PostgreSQL type names (and their common aliases) when parsed from
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    Bool,
    SmallInt,
    Int,
    BigInt,
    Float,
    Decimal,
    Text,
    Timestamp,
    TimestampTz,
    Date,
    Uuid,
}

impl ColumnType {
    /// The PostgreSQL type used when a column has to be spelled out in SQL,
    /// e.g. in a `jsonb_to_recordset` column definition list.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Bool => "boolean",
            ColumnType::SmallInt => "smallint",
            ColumnType::Int => "integer",
            ColumnType::BigInt => "bigint",
            ColumnType::Float => "double precision",
            ColumnType::Decimal => "numeric",
            ColumnType::Text => "text",
            ColumnType::Timestamp => "timestamp",
            ColumnType::TimestampTz => "timestamptz",
            ColumnType::Date => "date",
            ColumnType::Uuid => "uuid",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_type())
    }
}

impl FromStr for ColumnType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        let column_type = match normalized.as_str() {
            "bool" | "boolean" => ColumnType::Bool,
            "smallint" | "int2" => ColumnType::SmallInt,
            "int" | "integer" | "int4" => ColumnType::Int,
            "bigint" | "int8" => ColumnType::BigInt,
            "float" | "float8" | "double precision" | "double" => ColumnType::Float,
            "numeric" | "decimal" => ColumnType::Decimal,
            "text" | "varchar" | "character varying" | "string" => ColumnType::Text,
            "timestamp" | "timestamp without time zone" | "datetime" => ColumnType::Timestamp,
            "timestamptz" | "timestamp with time zone" => ColumnType::TimestampTz,
            "date" => ColumnType::Date,
            "uuid" => ColumnType::Uuid,
            _ => bail!("Unsupported column type '{}'", value),
        };
        Ok(column_type)
    }
}

impl TryFrom<String> for ColumnType {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.sql_type().to_string()
    }
}

/// A single named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Storage layout of one physical rollup table.
///
/// Key columns identify an aggregate row; fact columns hold its aggregates.
/// Values handed to the bulk sink are always ordered key columns first, then
/// fact columns, matching [`crate::rollup::value::RowValues`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    table: String,
    key_columns: Vec<Column>,
    fact_columns: Vec<Column>,
    identity_column: Option<String>,
}

impl TableSchema {
    /// Start a schema for the given table (`table` or `schema.table`).
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key_columns: Vec::new(),
            fact_columns: Vec::new(),
            identity_column: None,
        }
    }

    pub fn key(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.key_columns.push(Column::new(name, column_type));
        self
    }

    pub fn fact(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.fact_columns.push(Column::new(name, column_type));
        self
    }

    /// Name a store-generated identity column. It is never written by inserts.
    pub fn identity(mut self, name: impl Into<String>) -> Self {
        self.identity_column = Some(name.into());
        self
    }

    pub fn with_columns(mut self, key_columns: Vec<Column>, fact_columns: Vec<Column>) -> Self {
        self.key_columns = key_columns;
        self.fact_columns = fact_columns;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Quoted table reference for SQL (`"schema"."table"`).
    pub fn qualified_table(&self) -> String {
        quote_qualified(&self.table)
    }

    pub fn key_columns(&self) -> &[Column] {
        &self.key_columns
    }

    pub fn fact_columns(&self) -> &[Column] {
        &self.fact_columns
    }

    pub fn identity_column(&self) -> Option<&str> {
        self.identity_column.as_deref()
    }

    /// Columns written by an insert: key columns then fact columns, without
    /// the identity column.
    pub fn insert_columns(&self) -> Vec<&Column> {
        self.key_columns
            .iter()
            .chain(self.fact_columns.iter())
            .filter(|c| Some(c.name.as_str()) != self.identity_column.as_deref())
            .collect()
    }

    /// Position of a fact column by name.
    pub fn fact_index(&self, name: &str) -> Option<usize> {
        self.fact_columns.iter().position(|c| c.name == name)
    }

    /// Check the schema can be used for keyed deletes and inserts.
    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            bail!("Rollup table name cannot be empty");
        }
        if self.key_columns.is_empty() {
            bail!("Rollup table {} must declare at least one key column", self.table);
        }
        if let Some(identity) = &self.identity_column {
            if self
                .key_columns
                .iter()
                .chain(self.fact_columns.iter())
                .any(|c| &c.name == identity)
            {
                bail!(
                    "Identity column '{}' of {} is generated by the store and cannot be declared as a key or fact",
                    identity,
                    self.table
                );
            }
        }
        let mut seen = std::collections::HashSet::new();
        for column in self.key_columns.iter().chain(self.fact_columns.iter()) {
            if !seen.insert(column.name.as_str()) {
                bail!(
                    "Column '{}' is declared more than once for {}",
                    column.name,
                    self.table
                );
            }
        }
        Ok(())
    }
}
