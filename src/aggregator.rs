// 📊 Period Aggregator - monthly DRE/DFC buckets
//
//   DRE: (entity, accrual month, account label, nature)
//   DFC: (entity, settlement month, statement group, direction, bank account)
//
// Entries without a settlement date still feed the DRE but never the DFC.
// Totals are running signed sums; the emitted amount is abs(total) and
// zero-net buckets are dropped.

use crate::categorizer::StatementGroup;
use crate::chart::AccountDirectory;
use crate::entry::{CategorizedEntry, Direction, EntityId, Nature, NormalizedEntry, YearMonth};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

// ============================================================================
// BUCKET KEYS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DreKey {
    pub entity: EntityId,
    pub period: YearMonth,
    pub account: String,
    pub nature: Nature,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DfcKey {
    pub entity: EntityId,
    pub period: YearMonth,
    pub group: StatementGroup,
    pub direction: Direction,
    /// Empty string when the entry names no bank account
    pub bank_account: String,
}

impl DfcKey {
    /// Persisted category label ("Other Revenue" / "Other Expense" for Other)
    pub fn category(&self) -> &'static str {
        self.group.label(self.direction.nature())
    }
}

/// Bucket key plus its absolute total
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedRecord<K> {
    #[serde(flatten)]
    pub key: K,
    pub date: NaiveDate,
    pub amount: Decimal,
}

pub type DreRecord = AggregatedRecord<DreKey>;
pub type DfcRecord = AggregatedRecord<DfcKey>;

/// Both statements for one aggregation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Statements {
    pub dre: Vec<DreRecord>,
    pub dfc: Vec<DfcRecord>,
}

impl Statements {
    pub fn is_empty(&self) -> bool {
        self.dre.is_empty() && self.dfc.is_empty()
    }

    /// Revenue minus expense over the DRE rows
    pub fn dre_net(&self) -> Decimal {
        self.dre.iter().fold(Decimal::ZERO, |acc, r| match r.key.nature {
            Nature::Revenue => acc + r.amount,
            Nature::Expense => acc - r.amount,
        })
    }
}

// ============================================================================
// ACCOUNT LABEL
// ============================================================================

/// Chart display name → raw label → "Account {code}"
pub fn dre_account_label<D: AccountDirectory + ?Sized>(
    entry: &NormalizedEntry,
    chart: &D,
) -> String {
    if let Some(account) = entry.account_plan_id.as_deref().and_then(|id| chart.lookup(id)) {
        if !account.name.trim().is_empty() {
            return account.name.clone();
        }
    }

    if let Some(label) = entry.raw_account_label() {
        return label.to_string();
    }

    match entry.account_code().or_else(|| entry.account_plan_id.clone()) {
        Some(code) => format!("Account {}", code),
        None => "Account unknown".to_string(),
    }
}

// ============================================================================
// ACCUMULATOR
// ============================================================================

/// Running signed totals; merge is associative and commutative
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    dre: BTreeMap<DreKey, Decimal>,
    dfc: BTreeMap<DfcKey, Decimal>,
}

impl Aggregation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb<D: AccountDirectory + ?Sized>(&mut self, entry: &CategorizedEntry, chart: &D) {
        let normalized = entry.entry();
        let nature = entry.nature();

        let dre_key = DreKey {
            entity: normalized.entity.clone(),
            period: YearMonth::of(normalized.accrual_date),
            account: dre_account_label(normalized, chart),
            nature,
        };
        *self.dre.entry(dre_key).or_insert(Decimal::ZERO) += normalized.amount;

        let Some(settled) = normalized.settlement_date else {
            return;
        };

        let dfc_key = DfcKey {
            entity: normalized.entity.clone(),
            period: YearMonth::of(settled),
            group: entry.group,
            direction: nature.direction(),
            bank_account: normalized.bank_account.clone().unwrap_or_default(),
        };
        *self.dfc.entry(dfc_key).or_insert(Decimal::ZERO) += normalized.amount;
    }

    pub fn merge(&mut self, other: Aggregation) {
        for (key, total) in other.dre {
            *self.dre.entry(key).or_insert(Decimal::ZERO) += total;
        }
        for (key, total) in other.dfc {
            *self.dfc.entry(key).or_insert(Decimal::ZERO) += total;
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.dre.len() + self.dfc.len()
    }

    /// Finished records without giving up the signed totals
    pub fn statements(&self) -> Statements {
        self.clone().finish()
    }

    /// Emit records in key order, abs(total), zero totals dropped
    pub fn finish(self) -> Statements {
        Statements {
            dre: finish_buckets(self.dre, |k| k.period),
            dfc: finish_buckets(self.dfc, |k| k.period),
        }
    }
}

fn finish_buckets<K>(
    buckets: BTreeMap<K, Decimal>,
    period: impl Fn(&K) -> YearMonth,
) -> Vec<AggregatedRecord<K>> {
    let mut dropped = 0usize;
    let records: Vec<_> = buckets
        .into_iter()
        .filter_map(|(key, total)| {
            if total.is_zero() {
                dropped += 1;
                return None;
            }
            Some(AggregatedRecord {
                date: period(&key).first_day(),
                key,
                amount: total.abs(),
            })
        })
        .collect();

    if dropped > 0 {
        tracing::debug!(dropped, "zero-net buckets dropped");
    }
    records
}

/// Signed accumulator over a unit's categorized entries
pub fn accumulate<D: AccountDirectory + ?Sized>(
    entries: &[CategorizedEntry],
    chart: &D,
) -> Aggregation {
    let mut aggregation = Aggregation::new();
    for entry in entries {
        aggregation.absorb(entry, chart);
    }
    aggregation
}

/// One pass over a unit's categorized entries
pub fn aggregate<D: AccountDirectory + ?Sized>(
    entries: &[CategorizedEntry],
    chart: &D,
) -> Statements {
    accumulate(entries, chart).finish()
}

// ============================================================================
// CONSOLIDATION (entity-free group view)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConsolidatedKey<S> {
    pub period: YearMonth,
    pub label: String,
    pub side: S,
}

pub type ConsolidatedRow<S> = AggregatedRecord<ConsolidatedKey<S>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsolidatedStatements {
    pub dre: Vec<ConsolidatedRow<Nature>>,
    pub dfc: Vec<ConsolidatedRow<Direction>>,
}

/// Sum per-entity signed totals into (month, label, side) rows.
/// Works on the accumulators, not on finished records: a bucket that netted
/// negative for one entity must offset the others, not add its magnitude.
pub fn consolidate<'a>(
    aggregations: impl IntoIterator<Item = &'a Aggregation>,
) -> ConsolidatedStatements {
    let mut dre: BTreeMap<ConsolidatedKey<Nature>, Decimal> = BTreeMap::new();
    let mut dfc: BTreeMap<ConsolidatedKey<Direction>, Decimal> = BTreeMap::new();

    for aggregation in aggregations {
        for (key, total) in &aggregation.dre {
            let group_key = ConsolidatedKey {
                period: key.period,
                label: key.account.clone(),
                side: key.nature,
            };
            *dre.entry(group_key).or_insert(Decimal::ZERO) += *total;
        }
        for (key, total) in &aggregation.dfc {
            let group_key = ConsolidatedKey {
                period: key.period,
                label: key.category().to_string(),
                side: key.direction,
            };
            *dfc.entry(group_key).or_insert(Decimal::ZERO) += *total;
        }
    }

    ConsolidatedStatements {
        dre: finish_buckets(dre, |k| k.period),
        dfc: finish_buckets(dfc, |k| k.period),
    }
}

// ============================================================================
// TESTS
// ============================================================================
