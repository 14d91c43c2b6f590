// ABOUTME: Integration tests against a live PostgreSQL 13+ database
// ABOUTME: Covers trigger capture, pipeline runs over the change log, checks and pruning

use database_rollup::config::RollupConfig;
use database_rollup::pipeline::{Connections, PipelineRunner};
use database_rollup::postgres::{PgChangeFeed, PgWatermarkStore, SqlSnapshot};
use database_rollup::rollup::diff::MismatchFinder;
use database_rollup::rollup::feed::ChangeFeed;
use database_rollup::rollup::validator::TotalsValidator;
use database_rollup::rollup::value::RollupRow;
use database_rollup::rollup::watermark::{Watermark, WatermarkStore};
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

/// Helper to get test database URLs from environment; the target defaults to
/// the source.
fn get_test_urls() -> Option<(String, String)> {
    let source = env::var("TEST_SOURCE_URL").ok()?;
    let target = env::var("TEST_TARGET_URL").unwrap_or_else(|_| source.clone());
    Some((source, target))
}

/// Config for one pipeline rolling `<prefix>_sales` up into `<prefix>_totals`.
fn sales_config(prefix: &str, source: &str, target: &str) -> RollupConfig {
    let toml = format!(
        r#"
[database]
source_url = "{source}"
target_url = "{target}"

[change_feed]
log_table = "public.{prefix}_changes"

[watermarks]
table = "public.{prefix}_watermark"

[[pipelines]]
name = "{prefix}"
chunk_size = 2
atomic = true
tracked_tables = ["public.{prefix}_sales"]

[[pipelines.tables]]
table = "public.{prefix}_totals"
strategy = "two-phase"
identity_column = "id"
key = [
    {{ name = "region", type = "text" }},
    {{ name = "year", type = "integer" }},
]
facts = [{{ name = "total", type = "numeric" }}]
key_query = """
SELECT DISTINCT k.region, k.year
FROM public.{prefix}_changes c
CROSS JOIN LATERAL (VALUES
    (c.old_row->>'region', (c.old_row->>'year')::integer),
    (c.new_row->>'region', (c.new_row->>'year')::integer)
) AS k(region, year)
WHERE c.change_xid > ($1::bigint)::text::xid8
  AND c.table_name = 'public.{prefix}_sales'
  AND k.region IS NOT NULL
"""
rollup_query = """
SELECT s.region, s.year, sum(s.price) AS total
FROM public.{prefix}_sales s
JOIN {{keys}} ON keys.region = s.region AND keys.year = s.year
GROUP BY s.region, s.year
"""

[[checks]]
name = "{prefix}"
key = [
    {{ name = "region", type = "text" }},
    {{ name = "year", type = "integer" }},
]
facts = [{{ name = "total", type = "numeric" }}]
source_query = "SELECT region, year, sum(price) AS total FROM public.{prefix}_sales GROUP BY region, year"
rollup_query = "SELECT region, year, total FROM public.{prefix}_totals"
"#,
        source = source,
        target = target,
        prefix = prefix,
    );
    RollupConfig::parse(&toml).expect("Test config must be valid")
}

/// Drop and recreate the detail, rollup, log and watermark tables of `prefix`.
async fn setup(connections: &Connections, prefix: &str) -> anyhow::Result<()> {
    connections
        .source()
        .batch_execute(&format!(
            r#"
            DROP TABLE IF EXISTS public.{prefix}_sales CASCADE;
            DROP TABLE IF EXISTS public.{prefix}_changes CASCADE;
            CREATE TABLE public.{prefix}_sales (
                id SERIAL PRIMARY KEY,
                region TEXT NOT NULL,
                item_type TEXT NOT NULL,
                year INTEGER NOT NULL,
                price NUMERIC(12, 2) NOT NULL
            );
            "#,
            prefix = prefix
        ))
        .await?;
    connections
        .target()
        .batch_execute(&format!(
            r#"
            DROP TABLE IF EXISTS public.{prefix}_totals CASCADE;
            DROP TABLE IF EXISTS public.{prefix}_watermark CASCADE;
            CREATE TABLE public.{prefix}_totals (
                id BIGSERIAL PRIMARY KEY,
                region TEXT NOT NULL,
                year INTEGER NOT NULL,
                total NUMERIC(14, 2)
            );
            "#,
            prefix = prefix
        ))
        .await?;
    Ok(())
}

async fn cleanup(connections: &Connections, prefix: &str) {
    let _ = connections
        .source()
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS public.{prefix}_sales CASCADE; \
             DROP TABLE IF EXISTS public.{prefix}_changes CASCADE; \
             DROP FUNCTION IF EXISTS public.{prefix}_changes_capture() CASCADE;",
            prefix = prefix
        ))
        .await;
    let _ = connections
        .target()
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS public.{prefix}_totals CASCADE; \
             DROP TABLE IF EXISTS public.{prefix}_watermark CASCADE;",
            prefix = prefix
        ))
        .await;
}

async fn totals(connections: &Connections, prefix: &str) -> Vec<(String, i32, Decimal)> {
    connections
        .target()
        .query(
            &format!(
                "SELECT region, year, total FROM public.{}_totals ORDER BY region, year",
                prefix
            ),
            &[],
        )
        .await
        .expect("Failed to read rollup table")
        .iter()
        .map(|row| (row.get(0), row.get(1), row.get(2)))
        .collect()
}

fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap()
}

/// Test: triggers capture changes and the feed reports them by sequence
#[tokio::test]
#[ignore]
async fn test_change_feed_captures_and_prunes() {
    let (source_url, target_url) =
        get_test_urls().expect("TEST_SOURCE_URL must be set");
    let prefix = "rollup_it_feed";
    let config = sales_config(prefix, &source_url, &target_url);
    let connections = Connections::open(&config)
        .await
        .expect("Failed to connect");
    setup(&connections, prefix).await.unwrap();

    let log_table = format!("public.{}_changes", prefix);
    let sales_table = format!("public.{}_sales", prefix);
    let feed = PgChangeFeed::new(connections.source(), &log_table)
        .unwrap()
        .with_tables(&[sales_table.clone()])
        .unwrap();
    feed.install_tracking(&sales_table).await.unwrap();

    let before = feed.current_sequence_number().await.unwrap();
    assert!(!feed.has_changes_since(before).await.unwrap());

    connections
        .source()
        .batch_execute(&format!(
            "INSERT INTO {t} (region, item_type, year, price) VALUES ('West', 'Widget', 2024, 10.00);
             UPDATE {t} SET price = 12.50 WHERE region = 'West';",
            t = sales_table
        ))
        .await
        .unwrap();

    assert!(feed.has_changes_since(before).await.unwrap());
    let changes = feed.changes_since(&sales_table, before).await.unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].op, "INSERT");
    assert_eq!(changes[1].op, "UPDATE");
    assert!(changes[1].old_row.is_some());
    assert_eq!(changes[0].table_name, sales_table);

    let after = feed.current_sequence_number().await.unwrap();
    assert!(after >= changes[1].sequence);
    assert!(!feed.has_changes_since(after).await.unwrap());

    assert_eq!(feed.prune(after).await.unwrap(), 2);
    assert!(feed.changes_since(&sales_table, before).await.unwrap().is_empty());

    cleanup(&connections, prefix).await;
}

/// Test: a pipeline run builds the rollup, later runs recompute touched groups
#[tokio::test]
#[ignore]
async fn test_pipeline_lifecycle() {
    let (source_url, target_url) =
        get_test_urls().expect("TEST_SOURCE_URL must be set");
    let prefix = "rollup_it_pipeline";
    let config = sales_config(prefix, &source_url, &target_url);
    let connections = Connections::open(&config)
        .await
        .expect("Failed to connect");
    setup(&connections, prefix).await.unwrap();

    let sales_table = format!("public.{}_sales", prefix);
    PgChangeFeed::new(connections.source(), &config.change_feed.log_table)
        .unwrap()
        .install_tracking(&sales_table)
        .await
        .unwrap();

    let runner = PipelineRunner::new(&config, &connections).await.unwrap();
    let pipeline = config.pipeline(prefix).unwrap();

    // Initial load over three groups, chunked two at a time
    connections
        .source()
        .batch_execute(&format!(
            "INSERT INTO {t} (region, item_type, year, price) VALUES
                ('West', 'Widget', 2024, 100.00),
                ('West', 'Gadget', 2024, 50.00),
                ('East', 'Widget', 2024, 75.00),
                ('East', 'Widget', 2023, 20.00);",
            t = sales_table
        ))
        .await
        .unwrap();

    assert!(runner.has_changes_for(pipeline).await.unwrap());
    let first = runner.run_pipeline(pipeline).await.unwrap();
    assert_eq!(first.since_version, Watermark::BEGINNING);
    assert_eq!(first.stats.keys, 3);
    assert_eq!(first.affected_rows(), 3);
    assert_eq!(
        totals(&connections, prefix).await,
        vec![
            ("East".to_string(), 2023, dec("20.00")),
            ("East".to_string(), 2024, dec("75.00")),
            ("West".to_string(), 2024, dec("150.00")),
        ]
    );
    assert!(!runner.has_changes_for(pipeline).await.unwrap());

    // Move a sale between groups and empty another group
    connections
        .source()
        .batch_execute(&format!(
            "UPDATE {t} SET region = 'East' WHERE item_type = 'Gadget';
             DELETE FROM {t} WHERE year = 2023;",
            t = sales_table
        ))
        .await
        .unwrap();

    let second = runner.run_pipeline(pipeline).await.unwrap();
    assert_eq!(second.since_version, first.as_of_version);
    assert_eq!(second.stats.keys, 3);
    assert_eq!(
        totals(&connections, prefix).await,
        vec![
            ("East".to_string(), 2024, dec("125.00")),
            ("West".to_string(), 2024, dec("100.00")),
        ]
    );

    // Re-running over the same range changes nothing
    let store = PgWatermarkStore::new(connections.target(), &config.watermarks.table).unwrap();
    let stored = store.get_or_create(prefix).await.unwrap();
    assert_eq!(stored.version, second.as_of_version);
    connections
        .target()
        .execute(
            &format!("UPDATE public.{}_watermark SET version = $1", prefix),
            &[&first.as_of_version],
        )
        .await
        .unwrap();
    let replay = runner.run_pipeline(pipeline).await.unwrap();
    assert_eq!(replay.affected_rows(), second.affected_rows());
    assert_eq!(totals(&connections, prefix).await.len(), 2);

    // The rollup agrees with a live aggregation
    let check = config.check(prefix).unwrap();
    let snapshot = SqlSnapshot::new(
        connections.source(),
        connections.target(),
        check.schema(),
        &check.source_query,
        &check.rollup_query,
    );
    let validator = TotalsValidator::new(
        |row: &RollupRow| row.key().clone(),
        |row: &RollupRow| row.fact(0).cloned(),
    );
    let report = validator.validate(&snapshot).await.unwrap();
    assert!(report.are_same, "mismatches: {:?}", report.mismatches);
    assert_eq!(report.keys_compared, 2);

    let finder = MismatchFinder::new(|row: &RollupRow| row.key().clone());
    assert!(finder.query(&snapshot).await.unwrap().is_empty());

    cleanup(&connections, prefix).await;
}
