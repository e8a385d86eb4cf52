// ⚖️ Reconciliation Planner - natural keys and idempotent upsert batches
//
// Merge policy is full-recompute replace: a planned row carries the complete
// aggregate for its natural key and overwrites whatever the store holds.
// Rows are never added onto a previously persisted amount. A unit's plan
// also carries its scope, so rows the recompute no longer emits (a bucket
// that netted to zero, an entry that moved account) are pruned.
//
//   records → merge by natural key (sum) → chunk into batches ≤ batch_size

use crate::aggregator::{DfcRecord, DreRecord, Statements};
use crate::entry::{Direction, EntityId, Nature, YearMonth};
use crate::error::PersistenceError;
use crate::source::UnitOfWork;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_BATCH_SIZE: usize = 500;

// ============================================================================
// NATURAL KEYS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    Dre,
    Dfc,
}

/// Composite key with structural equality; no delimiter-joined strings
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "statement", rename_all = "lowercase")]
pub enum NaturalKey {
    Dre {
        entity: EntityId,
        date: NaiveDate,
        account: String,
        nature: Nature,
    },
    Dfc {
        entity: EntityId,
        date: NaiveDate,
        direction: Direction,
        category: String,
        bank_account: String,
    },
}

impl NaturalKey {
    pub fn kind(&self) -> StatementKind {
        match self {
            NaturalKey::Dre { .. } => StatementKind::Dre,
            NaturalKey::Dfc { .. } => StatementKind::Dfc,
        }
    }

    pub fn entity(&self) -> &EntityId {
        match self {
            NaturalKey::Dre { entity, .. } | NaturalKey::Dfc { entity, .. } => entity,
        }
    }

    pub fn date(&self) -> NaiveDate {
        match self {
            NaturalKey::Dre { date, .. } | NaturalKey::Dfc { date, .. } => *date,
        }
    }

    /// Key fields in a fixed order
    pub fn fields(&self) -> Vec<String> {
        match self {
            NaturalKey::Dre { entity, date, account, nature } => vec![
                "dre".to_string(),
                entity.to_string(),
                date.to_string(),
                account.clone(),
                nature.as_str().to_string(),
            ],
            NaturalKey::Dfc { entity, date, direction, category, bank_account } => vec![
                "dfc".to_string(),
                entity.to_string(),
                date.to_string(),
                direction.as_str().to_string(),
                category.clone(),
                bank_account.clone(),
            ],
        }
    }

    /// SHA-256 over length-prefixed fields, so no field value can collide
    /// with a neighbour's boundary
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for field in self.fields() {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Anything the planner can turn into an upsert row
pub trait Keyed {
    fn natural_key(&self) -> NaturalKey;
    fn amount(&self) -> Decimal;
}

impl Keyed for DreRecord {
    fn natural_key(&self) -> NaturalKey {
        NaturalKey::Dre {
            entity: self.key.entity.clone(),
            date: self.date,
            account: self.key.account.clone(),
            nature: self.key.nature,
        }
    }

    fn amount(&self) -> Decimal {
        self.amount
    }
}

impl Keyed for DfcRecord {
    fn natural_key(&self) -> NaturalKey {
        NaturalKey::Dfc {
            entity: self.key.entity.clone(),
            date: self.date,
            direction: self.key.direction,
            category: self.key.category().to_string(),
            bank_account: self.key.bank_account.clone(),
        }
    }

    fn amount(&self) -> Decimal {
        self.amount
    }
}

// ============================================================================
// PLAN
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpsertRow {
    pub key: NaturalKey,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpsertBatch {
    pub rows: Vec<UpsertRow>,
}

impl UpsertBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Rows a unit owns in the store: one entity, optionally bounded by month.
/// Bounds are first-of-month dates, `None` meaning open-ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanScope {
    pub entity: EntityId,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl PlanScope {
    pub fn for_unit(unit: &UnitOfWork) -> Self {
        let bound = |date: NaiveDate| {
            (date != NaiveDate::MIN && date != NaiveDate::MAX)
                .then(|| YearMonth::of(date).first_day())
        };
        PlanScope {
            entity: unit.entity.clone(),
            from: bound(unit.period.start),
            to: bound(unit.period.end),
        }
    }

    pub fn contains(&self, key: &NaturalKey) -> bool {
        let date = key.date();
        key.entity() == &self.entity
            && self.from.map_or(true, |from| date >= from)
            && self.to.map_or(true, |to| date <= to)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpsertPlan {
    pub batches: Vec<UpsertBatch>,
    /// Set for unit plans; stored rows in scope but absent from the plan are stale
    pub scope: Option<PlanScope>,
}

impl UpsertPlan {
    pub fn row_count(&self) -> usize {
        self.batches.iter().map(UpsertBatch::len).sum()
    }

    pub fn rows(&self) -> impl Iterator<Item = &UpsertRow> {
        self.batches.iter().flat_map(|b| b.rows.iter())
    }

    /// Fingerprints of every planned row
    pub fn fingerprints(&self) -> BTreeSet<String> {
        self.rows().map(|row| row.key.fingerprint()).collect()
    }
}

pub struct ReconciliationPlanner {
    batch_size: usize,
}

impl ReconciliationPlanner {
    pub fn new() -> Self {
        Self::with_batch_size(DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(batch_size: usize) -> Self {
        ReconciliationPlanner {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Merge records sharing a natural key by summation, then batch
    pub fn plan<'a, R, I>(&self, records: I) -> UpsertPlan
    where
        R: Keyed + 'a,
        I: IntoIterator<Item = &'a R>,
    {
        let mut merged: BTreeMap<NaturalKey, Decimal> = BTreeMap::new();
        let mut seen = 0usize;
        for record in records {
            seen += 1;
            *merged.entry(record.natural_key()).or_insert(Decimal::ZERO) += record.amount();
        }

        if merged.len() < seen {
            tracing::debug!(
                records = seen,
                keys = merged.len(),
                "merged records sharing a natural key"
            );
        }

        let rows: Vec<UpsertRow> = merged
            .into_iter()
            .map(|(key, amount)| UpsertRow { key, amount })
            .collect();

        UpsertPlan {
            batches: rows
                .chunks(self.batch_size)
                .map(|chunk| UpsertBatch { rows: chunk.to_vec() })
                .collect(),
            scope: None,
        }
    }

    /// DRE rows first, then DFC rows; batches never mix statements
    pub fn plan_statements(&self, statements: &Statements) -> UpsertPlan {
        let mut plan = self.plan(&statements.dre);
        plan.batches.extend(self.plan(&statements.dfc).batches);
        plan
    }

    /// Statement plan that also owns the unit's slice of the store
    pub fn plan_unit(&self, unit: &UnitOfWork, statements: &Statements) -> UpsertPlan {
        UpsertPlan {
            scope: Some(PlanScope::for_unit(unit)),
            ..self.plan_statements(statements)
        }
    }
}

impl Default for ReconciliationPlanner {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// APPLY
// ============================================================================

/// Persistence collaborator: insert-or-replace on the natural key
pub trait UpsertSink {
    /// Returns the number of rows written
    fn upsert_batch(&mut self, batch: &UpsertBatch) -> Result<usize, PersistenceError>;

    /// Delete rows inside `scope` whose fingerprint is not in `keep`.
    /// Returns the number of rows removed.
    fn prune(
        &mut self,
        scope: &PlanScope,
        keep: &BTreeSet<String>,
    ) -> Result<usize, PersistenceError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplyReport {
    pub batches_written: usize,
    pub rows_written: usize,
    pub batches_retried: usize,
    pub batches_rejected: usize,
    pub rows_pruned: usize,
    pub prune_failed: bool,
    pub rejections: Vec<String>,
}

/// Each failed batch is retried once with the same rows, then reported and skipped
pub fn apply_plan<S: UpsertSink + ?Sized>(plan: &UpsertPlan, sink: &mut S) -> ApplyReport {
    let mut report = ApplyReport::default();

    for (index, batch) in plan.batches.iter().enumerate() {
        let first = sink.upsert_batch(batch);
        let outcome = match first {
            Ok(rows) => Ok(rows),
            Err(err) => {
                tracing::warn!(
                    batch = index,
                    rows = batch.len(),
                    error = %err,
                    "batch upsert failed, retrying once"
                );
                report.batches_retried += 1;
                sink.upsert_batch(batch)
            }
        };

        match outcome {
            Ok(rows) => {
                report.batches_written += 1;
                report.rows_written += rows;
            }
            Err(err) => {
                tracing::error!(
                    batch = index,
                    rows = batch.len(),
                    error = %err,
                    "batch rejected by persistence"
                );
                report.batches_rejected += 1;
                report.rejections.push(err.to_string());
            }
        }
    }

    // Pruning only removes keys absent from the plan, so rows of a rejected
    // batch keep their previous value
    if let Some(scope) = &plan.scope {
        let keep = plan.fingerprints();
        let outcome = sink.prune(scope, &keep).or_else(|err| {
            tracing::warn!(entity = %scope.entity, error = %err, "prune failed, retrying once");
            sink.prune(scope, &keep)
        });
        match outcome {
            Ok(pruned) => {
                if pruned > 0 {
                    tracing::info!(entity = %scope.entity, pruned, "stale statement rows removed");
                }
                report.rows_pruned = pruned;
            }
            Err(err) => {
                tracing::error!(entity = %scope.entity, error = %err, "stale rows left in place");
                report.prune_failed = true;
                report.rejections.push(err.to_string());
            }
        }
    }

    report
}

// ============================================================================
// TESTS
// ============================================================================
