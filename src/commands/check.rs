// ABOUTME: Consistency commands comparing rollup tables against live aggregations
// ABOUTME: validate checks one fact per key; diff lists missing rows and fact mismatches

use anyhow::{bail, Result};

use crate::config::{CheckConfig, RollupConfig};
use crate::pipeline::Connections;
use crate::postgres::SqlSnapshot;
use crate::rollup::diff::{MismatchFinder, MismatchType};
use crate::rollup::validator::TotalsValidator;
use crate::rollup::value::{RollupRow, Value};

fn snapshot<'a>(connections: &'a Connections, check: &CheckConfig) -> SqlSnapshot<'a> {
    SqlSnapshot::new(
        connections.source(),
        connections.target(),
        check.schema(),
        &check.source_query,
        &check.rollup_query,
    )
}

fn selected<'a>(config: &'a RollupConfig, check: Option<&str>) -> Result<Vec<&'a CheckConfig>> {
    let checks = config.select_checks(check)?;
    if checks.is_empty() {
        bail!("No checks configured");
    }
    Ok(checks)
}

/// Compare the configured fact per key; keys on one side only are ignored.
pub async fn validate(config: &RollupConfig, check: Option<&str>) -> Result<()> {
    let checks = selected(config, check)?;
    let connections = Connections::open(config).await?;
    let mut failed = Vec::new();

    for check in checks {
        let fact = check.fact_index()?;
        let validator = TotalsValidator::new(
            |row: &RollupRow| row.key().clone(),
            move |row: &RollupRow| row.fact(fact).cloned().unwrap_or(Value::Null),
        );
        let report = validator.validate(&snapshot(&connections, check)).await?;

        if report.are_same {
            println!(
                "✓ {}: {} keys compared, totals match",
                check.name, report.keys_compared
            );
        } else {
            println!(
                "✗ {}: {} of {} keys differ",
                check.name,
                report.mismatches.len(),
                report.keys_compared
            );
            for mismatch in &report.mismatches {
                println!("    {}", mismatch);
            }
            failed.push(check.name.clone());
        }
    }

    if !failed.is_empty() {
        bail!("Validation failed for: {}", failed.join(", "));
    }
    Ok(())
}

/// List rows present on one side only and rows whose facts differ.
pub async fn diff(config: &RollupConfig, check: Option<&str>, limit: usize) -> Result<()> {
    let checks = selected(config, check)?;
    let connections = Connections::open(config).await?;
    let mut failed = Vec::new();

    for check in checks {
        let finder = MismatchFinder::new(|row: &RollupRow| row.key().clone());
        let mut result = finder.query(&snapshot(&connections, check)).await?;
        result.sort_by_identity(|row: &RollupRow| row.key().clone());

        if result.is_empty() {
            println!("✓ {}: rollup matches the source", check.name);
            continue;
        }
        failed.push(check.name.clone());

        println!(
            "✗ {}: {} missing rows, {} fact mismatches",
            check.name,
            result.dimension_mismatches.len(),
            result.fact_mismatches.len()
        );
        for mismatch in result.dimension_mismatches.iter().take(limit) {
            let facts = format_facts(mismatch.record.facts());
            match mismatch.mismatch_type {
                MismatchType::NotInRollup => {
                    println!("    missing in rollup: {} {}", mismatch.record.key(), facts)
                }
                MismatchType::NotInTransactional => {
                    println!("    not in source:     {} {}", mismatch.record.key(), facts)
                }
            }
        }
        for mismatch in result.fact_mismatches.iter().take(limit) {
            println!(
                "    facts differ:      {} source {} rollup {}",
                mismatch.transactional.key(),
                format_facts(mismatch.transactional.facts()),
                format_facts(mismatch.rollup.facts())
            );
        }
        let shown = result.dimension_mismatches.len().min(limit)
            + result.fact_mismatches.len().min(limit);
        if shown < result.len() {
            println!("    ... {} more", result.len() - shown);
        }
    }

    if !failed.is_empty() {
        bail!("Differences found for: {}", failed.join(", "));
    }
    Ok(())
}

fn format_facts(facts: &[Value]) -> String {
    let parts: Vec<String> = facts.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(", "))
}
