// ABOUTME: Watermark for a rollup pipeline - how far the change feed has been consumed
// ABOUTME: Defines the store contract and a JSON file backed store

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Progress marker of one rollup pipeline.
///
/// All changes with a sequence number up to and including `version` have
/// been merged into the pipeline's rollup tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Pipeline name
    pub name: String,
    /// Last change feed sequence number fully applied
    pub version: i64,
    /// When the watermark last advanced (informational)
    pub last_sync_utc: Option<DateTime<Utc>>,
}

impl Watermark {
    /// Version of a pipeline that has never run.
    pub const BEGINNING: i64 = 0;

    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: Self::BEGINNING,
            last_sync_utc: None,
        }
    }

    /// Record a successful run up to `as_of`. The version never moves backward.
    pub fn advance(&mut self, as_of: i64) {
        self.version = self.version.max(as_of);
        self.last_sync_utc = Some(Utc::now());
    }
}

/// Persistence of watermarks, one per pipeline name.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Stored watermark for `name`, or a fresh one at [`Watermark::BEGINNING`].
    /// A fresh watermark is persisted by the first successful `save`.
    async fn get_or_create(&self, name: &str) -> Result<Watermark>;

    /// Persist `watermark`. A stored version is never lowered.
    async fn save(&self, watermark: &Watermark) -> Result<()>;

    /// All stored watermarks, ordered by name.
    async fn list(&self) -> Result<Vec<Watermark>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WatermarkFile {
    /// Version of the file format
    version: u32,
    watermarks: BTreeMap<String, Watermark>,
    updated_at: Option<DateTime<Utc>>,
}

/// Watermark store backed by a JSON file.
///
/// Every save rewrites the file through a temporary sibling and a rename.
/// Runs of different pipelines sharing one file must not overlap.
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default location relative to the working directory.
    pub fn default_path() -> PathBuf {
        PathBuf::from(".database-rollup/watermarks.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<WatermarkFile> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(WatermarkFile {
                version: 1,
                ..Default::default()
            });
        }
        let contents = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read watermarks from {:?}", self.path))?;
        let file: WatermarkFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse watermarks from {:?}", self.path))?;
        Ok(file)
    }

    async fn write(&self, file: &WatermarkFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(file).context("Failed to serialize watermarks")?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, contents)
            .await
            .with_context(|| format!("Failed to write watermarks to {:?}", tmp_path))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("Failed to replace watermarks at {:?}", self.path))?;
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn get_or_create(&self, name: &str) -> Result<Watermark> {
        let file = self.load().await?;
        Ok(file
            .watermarks
            .get(name)
            .cloned()
            .unwrap_or_else(|| Watermark::new(name)))
    }

    async fn save(&self, watermark: &Watermark) -> Result<()> {
        let mut file = self.load().await?;
        file.version = 1;
        let mut saved = watermark.clone();
        if let Some(stored) = file.watermarks.get(&watermark.name) {
            // A stale save never moves the stored version backward.
            saved.version = saved.version.max(stored.version);
        }
        file.watermarks.insert(saved.name.clone(), saved);
        file.updated_at = Some(Utc::now());
        self.write(&file).await
    }

    async fn list(&self) -> Result<Vec<Watermark>> {
        let file = self.load().await?;
        Ok(file.watermarks.into_values().collect())
    }
}
