// ABOUTME: Totals validator - checks one scalar fact per key between live and rollup snapshots
// ABOUTME: Keys present on only one side are ignored; presence is the mismatch finder's job

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

use super::diff::SnapshotSource;

#[derive(Debug, Clone, PartialEq)]
pub struct TotalsMismatch<K, F> {
    pub key: K,
    pub rollup_fact: F,
    pub live_fact: F,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport<K, F> {
    /// True iff `mismatches` is empty
    pub are_same: bool,
    pub mismatches: Vec<TotalsMismatch<K, F>>,
    /// Keys present in both snapshots
    pub keys_compared: usize,
}

impl<K: fmt::Display, F: fmt::Display> fmt::Display for TotalsMismatch<K, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: rollup {} != live {}",
            self.key, self.rollup_fact, self.live_fact
        )
    }
}

/// Compares one fact per key between the rollup and a live aggregation.
pub struct TotalsValidator<T, GK, GF> {
    key: GK,
    fact: GF,
    _record: PhantomData<fn(&T)>,
}

impl<T, K, F, GK, GF> TotalsValidator<T, GK, GF>
where
    GK: Fn(&T) -> K,
    GF: Fn(&T) -> F,
    K: Eq + Hash + Clone + fmt::Debug,
    F: PartialEq,
{
    pub fn new(key: GK, fact: GF) -> Self {
        Self {
            key,
            fact,
            _record: PhantomData,
        }
    }

    /// Inner-join both snapshots on key and report facts that differ, in
    /// rollup order.
    pub fn compare(&self, rollup: Vec<T>, live: Vec<T>) -> ValidationReport<K, F> {
        let mut live_facts: HashMap<K, F> = HashMap::with_capacity(live.len());
        for record in &live {
            let key = (self.key)(record);
            if live_facts.contains_key(&key) {
                tracing::warn!("Duplicate key {:?} in live snapshot; keeping the first", key);
                continue;
            }
            live_facts.insert(key, (self.fact)(record));
        }

        let mut seen = HashSet::with_capacity(rollup.len());
        let mut mismatches = Vec::new();
        let mut keys_compared = 0;
        for record in &rollup {
            let key = (self.key)(record);
            if !seen.insert(key.clone()) {
                tracing::warn!("Duplicate key {:?} in rollup snapshot; keeping the first", key);
                continue;
            }
            let Some(live_fact) = live_facts.remove(&key) else {
                continue;
            };
            keys_compared += 1;
            let rollup_fact = (self.fact)(record);
            if rollup_fact != live_fact {
                mismatches.push(TotalsMismatch {
                    key,
                    rollup_fact,
                    live_fact,
                });
            }
        }

        ValidationReport {
            are_same: mismatches.is_empty(),
            mismatches,
            keys_compared,
        }
    }

    /// Fetch the live and rollup snapshots from `source` and compare them.
    pub async fn validate<S>(&self, source: &S) -> Result<ValidationReport<K, F>>
    where
        S: SnapshotSource<Record = T> + ?Sized,
    {
        let live = source.query_source().await?;
        let rollup = source.query_rollup().await?;
        Ok(self.compare(rollup, live))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Total {
        key: &'static str,
        total: i64,
    }

    fn totals(pairs: &[(&'static str, i64)]) -> Vec<Total> {
        pairs
            .iter()
            .map(|&(key, total)| Total { key, total })
            .collect()
    }

    fn validator() -> TotalsValidator<Total, impl Fn(&Total) -> &'static str, impl Fn(&Total) -> i64>
    {
        TotalsValidator::new(|t: &Total| t.key, |t: &Total| t.total)
    }

    #[test]
    fn test_reports_differing_fact() {
        let report = validator().compare(totals(&[("k", 10)]), totals(&[("k", 12)]));
        assert!(!report.are_same);
        assert_eq!(
            report.mismatches,
            vec![TotalsMismatch {
                key: "k",
                rollup_fact: 10,
                live_fact: 12,
            }]
        );
        assert_eq!(report.mismatches[0].to_string(), "k: rollup 10 != live 12");
    }

    #[test]
    fn test_one_sided_keys_are_ignored() {
        let report = validator().compare(
            totals(&[("a", 1), ("b", 2)]),
            totals(&[("b", 2), ("c", 3)]),
        );
        assert!(report.are_same);
        assert!(report.mismatches.is_empty());
        assert_eq!(report.keys_compared, 1);
    }

    #[test]
    fn test_empty_snapshots_are_same() {
        let report = validator().compare(Vec::new(), Vec::new());
        assert!(report.are_same);
        assert_eq!(report.keys_compared, 0);
    }
}
