// ABOUTME: Tests for loading rollup configuration files and the file watermark store
// ABOUTME: Also drives the CLI binary against configs that must fail before connecting

use database_rollup::config::{RollupConfig, Strategy, WatermarkBackend};
use database_rollup::rollup::watermark::{FileWatermarkStore, Watermark, WatermarkStore};
use std::fs;
use std::process::Command;
use tempfile::tempdir;

const CONFIG: &str = r#"
[database]
source_url = "postgresql://rollup@localhost/shop"
target_url = "postgresql://rollup@localhost/warehouse"

[change_feed]
log_table = "audit.changes"

[watermarks]
backend = "file"
path = "state/watermarks.json"

[[pipelines]]
name = "sales"
chunk_size = 50
atomic = true
tracked_tables = ["public.detail_sales", "public.items"]

[[pipelines.tables]]
table = "public.sales_by_region"
strategy = "single-phase"
key = [{ name = "region", type = "text" }]
facts = [
    { name = "total", type = "numeric" },
    { name = "orders", type = "bigint" },
]
change_query = """
SELECT region, sum(price) AS total, count(*) AS orders
FROM detail_sales
WHERE region IN (SELECT region FROM changed_regions($1))
GROUP BY region
"""

[[pipelines.tables]]
table = "public.sales_by_item"
strategy = "two-phase"
identity_column = "id"
key = [
    { name = "item_type", type = "text" },
    { name = "year", type = "integer" },
]
facts = [{ name = "total", type = "numeric" }]
key_query = "SELECT item_type, year FROM changed_items($1)"
rollup_query = "SELECT d.item_type, d.year, sum(d.price) AS total FROM detail_sales d JOIN {keys} USING (item_type, year) GROUP BY 1, 2"

[[checks]]
name = "sales_by_region"
key = [{ name = "region", type = "text" }]
facts = [
    { name = "total", type = "numeric" },
    { name = "orders", type = "bigint" },
]
fact = "orders"
source_query = "SELECT region, sum(price) AS total, count(*) AS orders FROM detail_sales GROUP BY region"
rollup_query = "SELECT region, total, orders FROM sales_by_region"
"#;

#[test]
fn test_load_full_config() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rollup.toml");
    fs::write(&path, CONFIG).unwrap();

    let config = RollupConfig::load(&path).unwrap();
    assert_eq!(config.change_feed.log_table, "audit.changes");
    assert_eq!(config.watermarks.backend, WatermarkBackend::File);
    assert_eq!(
        config.target_url().unwrap(),
        "postgresql://rollup@localhost/warehouse"
    );

    let pipeline = config.pipeline("sales").unwrap();
    assert_eq!(pipeline.chunk_size, 50);
    assert!(pipeline.atomic);
    assert_eq!(pipeline.tables.len(), 2);
    assert_eq!(pipeline.tables[0].strategy, Strategy::SinglePhase);
    assert_eq!(pipeline.tables[1].strategy, Strategy::TwoPhase);
    assert_eq!(
        pipeline.tables[1]
            .schema()
            .insert_columns()
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>(),
        vec!["item_type", "year", "total"]
    );

    let check = config.check("sales_by_region").unwrap();
    assert_eq!(check.fact_index().unwrap(), 1);
    assert_eq!(config.select_checks(None).unwrap().len(), 1);
}

#[test]
fn test_load_rejects_bad_configs() {
    let dir = tempdir().unwrap();
    let cases = [
        ("unknown key", CONFIG.replace("atomic = true", "atomically = true")),
        (
            "duplicate pipeline",
            format!(
                "{}\n[[pipelines]]\nname = \"sales\"\n{}",
                CONFIG,
                "[[pipelines.tables]]\ntable = \"t\"\nstrategy = \"single-phase\"\nkey = [{ name = \"k\", type = \"text\" }]\nchange_query = \"SELECT 1\"\n"
            ),
        ),
        (
            "injected table name",
            CONFIG.replace("public.sales_by_region", "public.sales; DROP TABLE x"),
        ),
        (
            "missing change query",
            CONFIG.replace("change_query = \"\"\"", "key_query = \"\"\""),
        ),
        ("unknown column type", CONFIG.replace("\"bigint\"", "\"money\"")),
        ("unknown check fact", CONFIG.replace("fact = \"orders\"", "fact = \"margin\"")),
    ];

    for (name, contents) in cases {
        let path = dir.path().join("rollup.toml");
        fs::write(&path, contents).unwrap();
        assert!(RollupConfig::load(&path).is_err(), "{} was accepted", name);
    }
}

#[test]
fn test_load_missing_file() {
    let dir = tempdir().unwrap();
    let err = RollupConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[tokio::test]
async fn test_file_watermark_store_persists_and_never_regresses() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("watermarks.json");
    let store = FileWatermarkStore::new(&path);

    let fresh = store.get_or_create("sales").await.unwrap();
    assert_eq!(fresh.version, Watermark::BEGINNING);
    assert!(store.list().await.unwrap().is_empty());

    let mut sales = fresh;
    sales.advance(42);
    store.save(&sales).await.unwrap();
    sales.advance(17);
    assert_eq!(sales.version, 42);
    store.save(&sales).await.unwrap();

    // A second handle still holding the old watermark saves late
    let mut stale = Watermark::new("sales");
    stale.advance(5);
    FileWatermarkStore::new(&path).save(&stale).await.unwrap();
    assert_eq!(store.get_or_create("sales").await.unwrap().version, 42);

    let mut items = Watermark::new("items");
    items.advance(7);
    store.save(&items).await.unwrap();

    let reopened = FileWatermarkStore::new(&path);
    let stored = reopened.get_or_create("sales").await.unwrap();
    assert_eq!(stored.version, 42);
    assert!(stored.last_sync_utc.is_some());

    let names: Vec<String> = reopened
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|w| w.name)
        .collect();
    assert_eq!(names, vec!["items", "sales"]);
}

#[test]
fn test_cli_reports_missing_config() {
    let dir = tempdir().unwrap();
    let bin_path = env!("CARGO_BIN_EXE_database-rollup");

    let output = Command::new(bin_path)
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("status")
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_cli_requires_source_url() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rollup.toml");
    let without_database = CONFIG
        .replace(
            "source_url = \"postgresql://rollup@localhost/shop\"\n",
            "",
        )
        .replace(
            "target_url = \"postgresql://rollup@localhost/warehouse\"\n",
            "",
        );
    fs::write(&path, without_database).unwrap();

    let bin_path = env!("CARGO_BIN_EXE_database-rollup");
    let output = Command::new(bin_path)
        .arg("--config")
        .arg(&path)
        .arg("run")
        .env_remove("ROLLUP_SOURCE_URL")
        .env_remove("ROLLUP_TARGET_URL")
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Source database URL not configured"));
}
