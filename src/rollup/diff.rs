// ABOUTME: Mismatch finder - compares a transactional and a rollup snapshot record by record
// ABOUTME: Reports identities missing on either side and records whose facts differ

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

/// Source of the two snapshots compared by [`MismatchFinder`] and
/// [`super::validator::TotalsValidator`].
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    type Record: Send;

    /// Records computed fresh from the transactional source.
    async fn query_source(&self) -> Result<Vec<Self::Record>>;

    /// Records as materialized in the rollup.
    async fn query_rollup(&self) -> Result<Vec<Self::Record>>;
}

/// Which side an identity is missing from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MismatchType {
    NotInTransactional,
    NotInRollup,
}

impl fmt::Display for MismatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MismatchType::NotInTransactional => f.write_str("not in transactional"),
            MismatchType::NotInRollup => f.write_str("not in rollup"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DimensionMismatch<T> {
    pub mismatch_type: MismatchType,
    pub record: T,
}

/// Records sharing an identity whose facts differ.
#[derive(Debug, Clone, PartialEq)]
pub struct FactMismatch<T> {
    pub transactional: T,
    pub rollup: T,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffResult<T> {
    pub dimension_mismatches: Vec<DimensionMismatch<T>>,
    pub fact_mismatches: Vec<FactMismatch<T>>,
}

impl<T> Default for DiffResult<T> {
    fn default() -> Self {
        Self {
            dimension_mismatches: Vec::new(),
            fact_mismatches: Vec::new(),
        }
    }
}

impl<T> DiffResult<T> {
    pub fn is_empty(&self) -> bool {
        self.dimension_mismatches.is_empty() && self.fact_mismatches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.dimension_mismatches.len() + self.fact_mismatches.len()
    }

    pub fn not_in_rollup(&self) -> impl Iterator<Item = &T> {
        self.missing(MismatchType::NotInRollup)
    }

    pub fn not_in_transactional(&self) -> impl Iterator<Item = &T> {
        self.missing(MismatchType::NotInTransactional)
    }

    fn missing(&self, mismatch_type: MismatchType) -> impl Iterator<Item = &T> {
        self.dimension_mismatches
            .iter()
            .filter(move |m| m.mismatch_type == mismatch_type)
            .map(|m| &m.record)
    }

    /// Order both parts by identity (dimension mismatches by side first).
    pub fn sort_by_identity<Id: Ord>(&mut self, identity: impl Fn(&T) -> Id) {
        self.dimension_mismatches
            .sort_by(|a, b| {
                (a.mismatch_type, identity(&a.record)).cmp(&(b.mismatch_type, identity(&b.record)))
            });
        self.fact_mismatches
            .sort_by(|a, b| identity(&a.transactional).cmp(&identity(&b.transactional)));
    }
}

/// Finds divergence between a transactional and a rollup snapshot.
///
/// `identity` and the fact comparison run exactly once per snapshot entry and
/// per shared identity respectively. Results follow input order. If a
/// snapshot repeats an identity, the first record wins.
pub struct MismatchFinder<T, I, F = fn(&T, &T) -> bool> {
    identity: I,
    facts_equal: F,
    _record: PhantomData<fn(&T)>,
}

impl<T: PartialEq, Id, I> MismatchFinder<T, I>
where
    I: Fn(&T) -> Id,
    Id: Eq + Hash + Clone + fmt::Debug,
{
    /// Finder comparing facts by structural equality of whole records.
    pub fn new(identity: I) -> Self {
        Self {
            identity,
            facts_equal: <T as PartialEq>::eq,
            _record: PhantomData,
        }
    }
}

impl<T, Id, I, F> MismatchFinder<T, I, F>
where
    I: Fn(&T) -> Id,
    Id: Eq + Hash + Clone + fmt::Debug,
    F: Fn(&T, &T) -> bool,
{
    /// Use `facts_equal(transactional, rollup)` to compare records sharing
    /// an identity.
    pub fn with_fact_comparison<G>(self, facts_equal: G) -> MismatchFinder<T, I, G>
    where
        G: Fn(&T, &T) -> bool,
    {
        MismatchFinder {
            identity: self.identity,
            facts_equal,
            _record: PhantomData,
        }
    }

    pub fn find(&self, transactional: Vec<T>, rollup: Vec<T>) -> DiffResult<T> {
        let transactional = self.index("transactional", transactional);
        let rollup_entries = self.index("rollup", rollup);
        let rollup_positions: HashMap<Id, usize> = rollup_entries
            .iter()
            .enumerate()
            .map(|(position, (id, _))| (id.clone(), position))
            .collect();
        let mut rollup: Vec<Option<T>> = rollup_entries
            .into_iter()
            .map(|(_, record)| Some(record))
            .collect();

        let mut result = DiffResult::default();
        for (id, record) in transactional {
            let matched = rollup_positions
                .get(&id)
                .and_then(|&position| rollup[position].take());
            match matched {
                Some(rollup_record) => {
                    if !(self.facts_equal)(&record, &rollup_record) {
                        result.fact_mismatches.push(FactMismatch {
                            transactional: record,
                            rollup: rollup_record,
                        });
                    }
                }
                None => result.dimension_mismatches.push(DimensionMismatch {
                    mismatch_type: MismatchType::NotInRollup,
                    record,
                }),
            }
        }

        result
            .dimension_mismatches
            .extend(rollup.into_iter().flatten().map(|record| DimensionMismatch {
                mismatch_type: MismatchType::NotInTransactional,
                record,
            }));

        result
    }

    /// Fetch both snapshots from `source` and compare them.
    pub async fn query<S>(&self, source: &S) -> Result<DiffResult<T>>
    where
        S: SnapshotSource<Record = T> + ?Sized,
    {
        let transactional = source.query_source().await?;
        let rollup = source.query_rollup().await?;
        let result = self.find(transactional, rollup);
        tracing::debug!(
            "Diff found {} dimension and {} fact mismatches",
            result.dimension_mismatches.len(),
            result.fact_mismatches.len()
        );
        Ok(result)
    }

    fn index(&self, side: &str, records: Vec<T>) -> Vec<(Id, T)> {
        let mut seen = HashSet::with_capacity(records.len());
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let id = (self.identity)(&record);
            if !seen.insert(id.clone()) {
                tracing::warn!("Duplicate identity {:?} in {} snapshot; keeping the first", id, side);
                continue;
            }
            entries.push((id, record));
        }
        entries
    }
}
