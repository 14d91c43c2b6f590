// ABOUTME: In-memory change feed, watermark store and bulk sink
// ABOUTME: Used by tests and for embedding the engine without a database

//! In-memory collaborators.
//!
//! None of these are durable; state lives only as long as the value. Each
//! supports failure injection so the failure semantics of a run can be
//! exercised without a database.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use super::bulk::BulkSink;
use super::feed::ChangeFeed;
use super::schema::TableSchema;
use super::value::Value;
use super::watermark::{Watermark, WatermarkStore};

fn poison_err<T>(_: PoisonError<T>) -> anyhow::Error {
    anyhow!("lock poisoned")
}

/// Change feed that hands out sequence numbers for recorded changes.
#[derive(Debug, Default)]
pub struct MemoryChangeFeed {
    sequence: AtomicI64,
    changes: Mutex<Vec<(i64, String)>>,
    fail_capture: AtomicBool,
}

impl MemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change to `table` and return its sequence number.
    pub fn record(&self, table: &str) -> i64 {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((sequence, table.to_string()));
        sequence
    }

    /// Move the sequence to `sequence` without recording a change.
    pub fn set_sequence(&self, sequence: i64) {
        self.sequence.store(sequence, Ordering::SeqCst);
    }

    /// Make `current_sequence_number` fail until cleared.
    pub fn fail_capture(&self, fail: bool) {
        self.fail_capture.store(fail, Ordering::SeqCst);
    }

    /// Sequence numbers of changes to `table` after `since_version`.
    pub fn changes_since(&self, table: &str, since_version: i64) -> Vec<i64> {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(sequence, changed)| *sequence > since_version && changed == table)
            .map(|(sequence, _)| *sequence)
            .collect()
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn current_sequence_number(&self) -> Result<i64> {
        if self.fail_capture.load(Ordering::SeqCst) {
            bail!("change feed unavailable");
        }
        Ok(self.sequence.load(Ordering::SeqCst))
    }

    async fn has_changes_since(&self, since_version: i64) -> Result<bool> {
        let changes = self.changes.lock().map_err(poison_err)?;
        Ok(changes.iter().any(|(sequence, _)| *sequence > since_version))
    }
}

/// Watermark store kept in a map.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    watermarks: Mutex<BTreeMap<String, Watermark>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `save` fail until cleared.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Stored watermark, if any run has saved one.
    pub fn get(&self, name: &str) -> Option<Watermark> {
        self.watermarks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get_or_create(&self, name: &str) -> Result<Watermark> {
        let watermarks = self.watermarks.lock().map_err(poison_err)?;
        Ok(watermarks
            .get(name)
            .cloned()
            .unwrap_or_else(|| Watermark::new(name)))
    }

    async fn save(&self, watermark: &Watermark) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            bail!("watermark store unavailable");
        }
        let mut watermarks = self.watermarks.lock().map_err(poison_err)?;
        let mut saved = watermark.clone();
        if let Some(stored) = watermarks.get(&watermark.name) {
            saved.version = saved.version.max(stored.version);
        }
        watermarks.insert(saved.name.clone(), saved);
        drop(watermarks);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Watermark>> {
        let watermarks = self.watermarks.lock().map_err(poison_err)?;
        Ok(watermarks.values().cloned().collect())
    }
}

/// Bulk sink storing rows per table name.
///
/// Rows are stored as insert-column tuples, so the first
/// `key_columns().len()` values of a row are its key.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: Mutex<BTreeMap<String, Vec<Vec<Value>>>>,
    calls: AtomicUsize,
    fail_on_call: Mutex<Option<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `call`-th sink call (counting from 1 across deletes and inserts).
    pub fn fail_on_call(&self, call: usize) {
        *self
            .fail_on_call
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(call);
    }

    /// Number of chunk calls received, failed ones included.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Current rows of `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Vec<Value>> {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Seed `table` with rows without counting a call.
    pub fn seed(&self, table: &str, rows: Vec<Vec<Value>>) {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    fn begin_call(&self) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let fail_on = *self.fail_on_call.lock().map_err(poison_err)?;
        if fail_on == Some(call) {
            bail!("injected failure on sink call {}", call);
        }
        Ok(())
    }
}

#[async_trait]
impl BulkSink for MemorySink {
    async fn delete_chunk(&self, schema: &TableSchema, keys: &[Vec<Value>]) -> Result<u64> {
        self.begin_call()?;
        let key_len = schema.key_columns().len();
        let doomed: HashSet<&[Value]> = keys.iter().map(|k| k.as_slice()).collect();

        let mut tables = self.tables.lock().map_err(poison_err)?;
        let rows = tables.entry(schema.table().to_string()).or_default();
        let before = rows.len();
        rows.retain(|row| row.len() < key_len || !doomed.contains(&row[..key_len]));
        Ok((before - rows.len()) as u64)
    }

    async fn insert_chunk(&self, schema: &TableSchema, rows: &[Vec<Value>]) -> Result<u64> {
        self.begin_call()?;
        let width = schema.insert_columns().len();
        if let Some(bad) = rows.iter().find(|row| row.len() != width) {
            bail!(
                "Row has {} values but {} declares {} insert columns",
                bad.len(),
                schema.table(),
                width
            );
        }

        let mut tables = self.tables.lock().map_err(poison_err)?;
        tables
            .entry(schema.table().to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }
}
