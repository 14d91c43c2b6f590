// ABOUTME: Scalar values, rollup keys and rollup rows with value semantics
// ABOUTME: Converts between tokio-postgres rows/parameters and typed rollup values

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use uuid::Uuid;

use super::schema::{Column, ColumnType, TableSchema};

/// A single storable scalar.
///
/// Equality, hashing and ordering are total: floats compare by bit pattern so
/// values can be used inside hashed keys.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Uuid(Uuid),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::SmallInt(_) => 2,
            Value::Int(_) => 3,
            Value::BigInt(_) => 4,
            Value::Float(_) => 5,
            Value::Decimal(_) => 6,
            Value::Text(_) => 7,
            Value::Timestamp(_) => 8,
            Value::TimestampTz(_) => 9,
            Value::Date(_) => 10,
            Value::Uuid(_) => 11,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Read one declared column from a result row.
    pub fn from_row(row: &Row, column: &Column) -> Result<Value> {
        let name = column.name.as_str();
        let value = match column.column_type {
            ColumnType::Bool => row.try_get::<_, Option<bool>>(name).map(|v| v.map(Value::Bool)),
            ColumnType::SmallInt => row
                .try_get::<_, Option<i16>>(name)
                .map(|v| v.map(Value::SmallInt)),
            ColumnType::Int => row.try_get::<_, Option<i32>>(name).map(|v| v.map(Value::Int)),
            ColumnType::BigInt => row
                .try_get::<_, Option<i64>>(name)
                .map(|v| v.map(Value::BigInt)),
            ColumnType::Float => row
                .try_get::<_, Option<f64>>(name)
                .map(|v| v.map(Value::Float)),
            ColumnType::Decimal => row
                .try_get::<_, Option<Decimal>>(name)
                .map(|v| v.map(Value::Decimal)),
            ColumnType::Text => row
                .try_get::<_, Option<String>>(name)
                .map(|v| v.map(Value::Text)),
            ColumnType::Timestamp => row
                .try_get::<_, Option<NaiveDateTime>>(name)
                .map(|v| v.map(Value::Timestamp)),
            ColumnType::TimestampTz => row
                .try_get::<_, Option<DateTime<Utc>>>(name)
                .map(|v| v.map(Value::TimestampTz)),
            ColumnType::Date => row
                .try_get::<_, Option<NaiveDate>>(name)
                .map(|v| v.map(Value::Date)),
            ColumnType::Uuid => row
                .try_get::<_, Option<Uuid>>(name)
                .map(|v| v.map(Value::Uuid)),
        }
        .with_context(|| format!("Failed to read column \"{}\" as {}", name, column.column_type))?;

        Ok(value.unwrap_or(Value::Null))
    }

    /// Convert to a boxed query parameter for a column of the given type.
    ///
    /// Integers widen to wider integer, numeric and float columns. NULL is
    /// typed from the column so the server accepts it.
    pub fn to_param(&self, column_type: ColumnType) -> Result<Box<dyn ToSql + Sync + Send>> {
        let param: Box<dyn ToSql + Sync + Send> = match (column_type, self) {
            (ty, Value::Null) => typed_null(ty),
            (ColumnType::Bool, Value::Bool(v)) => Box::new(*v),
            (ColumnType::SmallInt, Value::SmallInt(v)) => Box::new(*v),
            (ColumnType::Int, Value::SmallInt(v)) => Box::new(i32::from(*v)),
            (ColumnType::Int, Value::Int(v)) => Box::new(*v),
            (ColumnType::BigInt, Value::SmallInt(v)) => Box::new(i64::from(*v)),
            (ColumnType::BigInt, Value::Int(v)) => Box::new(i64::from(*v)),
            (ColumnType::BigInt, Value::BigInt(v)) => Box::new(*v),
            (ColumnType::Float, Value::SmallInt(v)) => Box::new(f64::from(*v)),
            (ColumnType::Float, Value::Int(v)) => Box::new(f64::from(*v)),
            (ColumnType::Float, Value::Float(v)) => Box::new(*v),
            (ColumnType::Decimal, Value::SmallInt(v)) => Box::new(Decimal::from(*v)),
            (ColumnType::Decimal, Value::Int(v)) => Box::new(Decimal::from(*v)),
            (ColumnType::Decimal, Value::BigInt(v)) => Box::new(Decimal::from(*v)),
            (ColumnType::Decimal, Value::Decimal(v)) => Box::new(*v),
            (ColumnType::Text, Value::Text(v)) => Box::new(v.clone()),
            (ColumnType::Timestamp, Value::Timestamp(v)) => Box::new(*v),
            (ColumnType::TimestampTz, Value::TimestampTz(v)) => Box::new(*v),
            (ColumnType::Date, Value::Date(v)) => Box::new(*v),
            (ColumnType::Uuid, Value::Uuid(v)) => Box::new(*v),
            (ty, other) => bail!("Cannot bind value {} to a {} column", other, ty),
        };
        Ok(param)
    }

    /// JSON form used when a key set is shipped to the server as one
    /// `jsonb` parameter. Non-finite floats have no JSON form and fail.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        use serde_json::Value as Json;
        let json = match self {
            Value::Null => Json::Null,
            Value::Bool(v) => Json::Bool(*v),
            Value::SmallInt(v) => Json::from(*v),
            Value::Int(v) => Json::from(*v),
            Value::BigInt(v) => Json::from(*v),
            Value::Float(v) => match serde_json::Number::from_f64(*v) {
                Some(number) => Json::Number(number),
                None => bail!("Cannot send non-finite float {} as JSON", v),
            },
            Value::Decimal(v) => Json::String(v.to_string()),
            Value::Text(v) => Json::String(v.clone()),
            Value::Timestamp(v) => Json::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Value::TimestampTz(v) => Json::String(v.to_rfc3339()),
            Value::Date(v) => Json::String(v.format("%Y-%m-%d").to_string()),
            Value::Uuid(v) => Json::String(v.to_string()),
        };
        Ok(json)
    }
}

fn typed_null(column_type: ColumnType) -> Box<dyn ToSql + Sync + Send> {
    match column_type {
        ColumnType::Bool => Box::new(None::<bool>),
        ColumnType::SmallInt => Box::new(None::<i16>),
        ColumnType::Int => Box::new(None::<i32>),
        ColumnType::BigInt => Box::new(None::<i64>),
        ColumnType::Float => Box::new(None::<f64>),
        ColumnType::Decimal => Box::new(None::<Decimal>),
        ColumnType::Text => Box::new(None::<String>),
        ColumnType::Timestamp => Box::new(None::<NaiveDateTime>),
        ColumnType::TimestampTz => Box::new(None::<DateTime<Utc>>),
        ColumnType::Date => Box::new(None::<NaiveDate>),
        ColumnType::Uuid => Box::new(None::<Uuid>),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::SmallInt(a), Value::SmallInt(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::BigInt(a), Value::BigInt(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Decimal(a), Value::Decimal(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::TimestampTz(a), Value::TimestampTz(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Uuid(a), Value::Uuid(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Bool(v) => v.hash(state),
            Value::SmallInt(v) => v.hash(state),
            Value::Int(v) => v.hash(state),
            Value::BigInt(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Decimal(v) => v.hash(state),
            Value::Text(v) => v.hash(state),
            Value::Timestamp(v) => v.hash(state),
            Value::TimestampTz(v) => v.hash(state),
            Value::Date(v) => v.hash(state),
            Value::Uuid(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::SmallInt(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::BigInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Decimal(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "'{}'", v),
            Value::Timestamp(v) => write!(f, "{}", v),
            Value::TimestampTz(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Date(v) => write!(f, "{}", v),
            Value::Uuid(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::BigInt(value)
    }
}

impl From<Decimal> for Value {
    fn from(value: Decimal) -> Self {
        Value::Decimal(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// Anything the bulk sink can store: an ordered list of values matching the
/// declared key columns (for keys) or key + fact columns (for rows).
pub trait RowValues {
    fn row_values(&self) -> Vec<Value>;
}

/// Ordered tuple of dimension values identifying one aggregate row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RollupKey(Vec<Value>);

impl RollupKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Read the declared key columns from a result row.
    pub fn from_row(row: &Row, schema: &TableSchema) -> Result<Self> {
        let values = schema
            .key_columns()
            .iter()
            .map(|column| Value::from_row(row, column))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(values))
    }

    /// Key as a JSON object keyed by column name.
    pub fn to_json(&self, key_columns: &[Column]) -> Result<serde_json::Value> {
        let object = key_columns
            .iter()
            .zip(self.0.iter())
            .map(|(column, value)| -> Result<(String, serde_json::Value)> {
                let json = value
                    .to_json()
                    .with_context(|| format!("Key column {} of {}", column.name, self))?;
                Ok((column.name.clone(), json))
            })
            .collect::<Result<serde_json::Map<_, _>>>()?;
        Ok(serde_json::Value::Object(object))
    }
}

impl From<Vec<Value>> for RollupKey {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl fmt::Display for RollupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|v| v.to_string()).collect();
        write!(f, "({})", parts.join(", "))
    }
}

impl RowValues for RollupKey {
    fn row_values(&self) -> Vec<Value> {
        self.0.clone()
    }
}

/// A rollup key plus its fact values, in declared fact column order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RollupRow {
    key: RollupKey,
    facts: Vec<Value>,
}

impl RollupRow {
    pub fn new(key: RollupKey, facts: Vec<Value>) -> Self {
        Self { key, facts }
    }

    /// Projection of a row onto its key.
    pub fn key(&self) -> &RollupKey {
        &self.key
    }

    pub fn facts(&self) -> &[Value] {
        &self.facts
    }

    pub fn fact(&self, index: usize) -> Option<&Value> {
        self.facts.get(index)
    }

    /// Read the declared key and fact columns from a result row.
    pub fn from_row(row: &Row, schema: &TableSchema) -> Result<Self> {
        let key = RollupKey::from_row(row, schema)?;
        let facts = schema
            .fact_columns()
            .iter()
            .map(|column| Value::from_row(row, column))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { key, facts })
    }
}

impl RowValues for RollupRow {
    fn row_values(&self) -> Vec<Value> {
        self.key.0.iter().chain(self.facts.iter()).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::str::FromStr;

    #[test]
    fn test_equal_keys_are_the_same_key() {
        let a = RollupKey::new(vec!["West".into(), "Widget".into(), 2023.into()]);
        let b = RollupKey::new(vec!["West".into(), "Widget".into(), 2023.into()]);
        let c = RollupKey::new(vec!["East".into(), "Widget".into(), 2023.into()]);

        let set: HashSet<RollupKey> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
    }

    #[test]
    fn test_decimal_equality_ignores_scale() {
        let a = Value::Decimal(Decimal::from_str("10.0").unwrap());
        let b = Value::Decimal(Decimal::from_str("10.00").unwrap());
        assert_eq!(a, b);

        let set: HashSet<Value> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_float_values_hash_and_compare() {
        let nan = Value::Float(f64::NAN);
        assert_eq!(nan, nan.clone());
        assert!(Value::Float(1.5) < Value::Float(2.0));
    }

    #[test]
    fn test_ordering_across_variants_is_stable() {
        let mut values = vec![Value::Text("a".into()), Value::Null, Value::Int(3)];
        values.sort();
        assert_eq!(values[0], Value::Null);
        assert_eq!(values[1], Value::Int(3));
    }

    #[test]
    fn test_row_values_are_key_then_facts() {
        let row = RollupRow::new(
            RollupKey::new(vec!["West".into(), 2023.into()]),
            vec![Value::BigInt(12)],
        );
        assert_eq!(
            row.row_values(),
            vec!["West".into(), Value::Int(2023), Value::BigInt(12)]
        );
        assert_eq!(row.key().len(), 2);
    }

    #[test]
    fn test_to_param_widens_integers() {
        assert!(Value::Int(5).to_param(ColumnType::BigInt).is_ok());
        assert!(Value::Int(5).to_param(ColumnType::Decimal).is_ok());
        assert!(Value::Null.to_param(ColumnType::Uuid).is_ok());
        assert!(Value::BigInt(5).to_param(ColumnType::Int).is_err());
        assert!(Value::Text("x".into()).to_param(ColumnType::Int).is_err());
    }

    #[test]
    fn test_key_to_json() {
        let columns = vec![
            Column::new("region", ColumnType::Text),
            Column::new("year", ColumnType::Int),
            Column::new("total", ColumnType::Decimal),
        ];
        let key = RollupKey::new(vec![
            "West".into(),
            2023.into(),
            Value::Decimal(Decimal::from_str("1.25").unwrap()),
        ]);
        assert_eq!(
            key.to_json(&columns).unwrap(),
            serde_json::json!({"region": "West", "year": 2023, "total": "1.25"})
        );
    }

    #[test]
    fn test_key_to_json_rejects_non_finite_floats() {
        let columns = vec![
            Column::new("region", ColumnType::Text),
            Column::new("ratio", ColumnType::Float),
        ];
        assert!(Value::Float(1.5).to_json().is_ok());
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let key = RollupKey::new(vec!["West".into(), Value::Float(bad)]);
            let err = key.to_json(&columns).unwrap_err();
            assert!(format!("{:#}", err).contains("non-finite float"));
        }
    }

    #[test]
    fn test_display() {
        let key = RollupKey::new(vec!["West".into(), Value::Null, 7.into()]);
        assert_eq!(key.to_string(), "('West', NULL, 7)");
    }
}
