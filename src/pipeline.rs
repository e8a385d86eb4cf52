// 🔄 Pipeline - one unit of work through every stage
//
//   RawEntry[] → Normalizer → Classifier → Categorizer → Aggregator → Planner
//
// Units (entity × period) run sequentially. A unit whose source fails is
// recorded and skipped; the run always continues with the next unit.
// Entries outside the unit's entity or period are rejected, so units never
// write each other's keys.

use crate::aggregator::{accumulate, Aggregation, Statements};
use crate::categorizer::CategoryTable;
use crate::chart::AccountDirectory;
use crate::classifier::{NatureClassifier, RuleId};
use crate::config::PipelineConfig;
use crate::entry::{CategorizedEntry, NormalizedEntry, RawEntry};
use crate::error::{EntryRejection, SourceError};
use crate::metrics::RunMetrics;
use crate::normalizer::Normalizer;
use crate::reconciliation::{apply_plan, ApplyReport, ReconciliationPlanner, UpsertPlan, UpsertSink};
use crate::source::{EntrySource, UnitOfWork};
use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use uuid::Uuid;

// ============================================================================
// REPORTS
// ============================================================================

/// Entry that fell through to the default classification, kept for audit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefaultedEntry {
    pub reference: Option<String>,
    pub account: Option<String>,
    pub accrual_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub unit: UnitOfWork,
    pub statements: Statements,
    /// Signed totals behind `statements`, used for the group view
    #[serde(skip)]
    pub aggregation: Aggregation,
    pub plan: UpsertPlan,
    pub metrics: RunMetrics,
    pub defaulted: Vec<DefaultedEntry>,
}

#[derive(Debug)]
pub enum UnitOutcome {
    Completed {
        report: UnitReport,
        applied: ApplyReport,
    },
    Failed {
        unit: UnitOfWork,
        error: SourceError,
    },
}

impl UnitOutcome {
    pub fn unit(&self) -> &UnitOfWork {
        match self {
            UnitOutcome::Completed { report, .. } => &report.unit,
            UnitOutcome::Failed { unit, .. } => unit,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, UnitOutcome::Failed { .. })
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub outcomes: Vec<UnitOutcome>,
    pub metrics: RunMetrics,
}

impl RunReport {
    pub fn completed(&self) -> impl Iterator<Item = &UnitReport> {
        self.outcomes.iter().filter_map(|o| match o {
            UnitOutcome::Completed { report, .. } => Some(report),
            UnitOutcome::Failed { .. } => None,
        })
    }

    pub fn failed(&self) -> impl Iterator<Item = (&UnitOfWork, &SourceError)> {
        self.outcomes.iter().filter_map(|o| match o {
            UnitOutcome::Failed { unit, error } => Some((unit, error)),
            UnitOutcome::Completed { .. } => None,
        })
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Stages plus the read-only chart of accounts, built once per run
pub struct Pipeline<D> {
    chart: D,
    normalizer: Normalizer,
    classifier: NatureClassifier,
    categories: CategoryTable,
    planner: ReconciliationPlanner,
}

impl<D: AccountDirectory> Pipeline<D> {
    pub fn new(chart: D) -> Self {
        Pipeline {
            chart,
            normalizer: Normalizer::default(),
            classifier: NatureClassifier::default(),
            categories: CategoryTable::default(),
            planner: ReconciliationPlanner::default(),
        }
    }

    pub fn from_config(chart: D, config: &PipelineConfig) -> Result<Self> {
        Ok(Pipeline {
            chart,
            normalizer: config.normalizer(),
            classifier: config.classifier(),
            categories: config.category_table()?,
            planner: config.planner(),
        })
    }

    pub fn chart(&self) -> &D {
        &self.chart
    }

    /// Categorized entries for one batch, with rejections and fallbacks counted
    pub fn categorize_all(
        &self,
        raws: &[RawEntry],
        metrics: &mut RunMetrics,
    ) -> (Vec<CategorizedEntry>, Vec<DefaultedEntry>) {
        self.categorize_within(raws, None, metrics)
    }

    fn categorize_within(
        &self,
        raws: &[RawEntry],
        unit: Option<&UnitOfWork>,
        metrics: &mut RunMetrics,
    ) -> (Vec<CategorizedEntry>, Vec<DefaultedEntry>) {
        let outcome = self.normalizer.normalize_all(raws);

        metrics.entries_seen += raws.len();
        for (_, reason) in &outcome.rejected {
            metrics.record_rejection(reason);
        }

        let entries: Vec<NormalizedEntry> = outcome
            .entries
            .into_iter()
            .filter(|entry| match unit.and_then(|u| outside_unit(u, entry)) {
                Some(reason) => {
                    tracing::warn!(
                        reference = entry.reference_id.as_deref().unwrap_or(""),
                        %reason,
                        "entry outside unit rejected"
                    );
                    metrics.record_rejection(&reason);
                    false
                }
                None => true,
            })
            .collect();
        metrics.entries_accepted += entries.len();

        let mut defaulted = Vec::new();
        let categorized = entries
            .into_iter()
            .map(|entry| {
                let classified = self.classifier.classify_entry(entry, &self.chart);
                metrics.record_classification(classified.rule);
                if classified.rule == RuleId::Default {
                    defaulted.push(DefaultedEntry {
                        reference: classified.entry.reference_id.clone(),
                        account: classified.entry.raw_account_label().map(str::to_string),
                        accrual_date: classified.entry.accrual_date,
                    });
                }
                self.categories.categorize(classified)
            })
            .collect();

        (categorized, defaulted)
    }

    /// Run the five stages for one unit; pure apart from logging
    pub fn run_unit(&self, unit: &UnitOfWork, raws: &[RawEntry]) -> UnitReport {
        let span = tracing::info_span!("unit", entity = %unit.entity, period = %unit.period);
        let _guard = span.enter();

        let mut metrics = RunMetrics::new();
        let (categorized, defaulted) = self.categorize_within(raws, Some(unit), &mut metrics);
        let aggregation = accumulate(&categorized, &self.chart);
        let statements = aggregation.statements();
        let plan = self.planner.plan_unit(unit, &statements);

        tracing::info!(
            entries = raws.len(),
            rejected = metrics.rejected_total(),
            fallbacks = metrics.fallback_total(),
            dre_rows = statements.dre.len(),
            dfc_rows = statements.dfc.len(),
            batches = plan.batches.len(),
            "unit processed"
        );

        UnitReport {
            unit: unit.clone(),
            statements,
            aggregation,
            plan,
            metrics,
            defaulted,
        }
    }

    /// Fetch, process and persist every unit in order
    pub fn run<S, K>(&self, units: &[UnitOfWork], source: &mut S, sink: &mut K) -> RunReport
    where
        S: EntrySource + ?Sized,
        K: UpsertSink + ?Sized,
    {
        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("run", run_id = %run_id);
        let _guard = span.enter();

        let mut metrics = RunMetrics::new();
        let mut outcomes = Vec::with_capacity(units.len());

        let stray = source.unassigned();
        if !stray.is_empty() {
            tracing::warn!(rows = stray.len(), "rows without a valid entity id rejected");
            metrics.record_unassigned(stray);
        }

        for unit in units {
            match source.fetch(unit) {
                Ok(raws) => {
                    let report = self.run_unit(unit, &raws);
                    let applied = apply_plan(&report.plan, sink);

                    metrics.merge(&report.metrics);
                    metrics.record_apply(&applied);
                    metrics.units_completed += 1;

                    outcomes.push(UnitOutcome::Completed { report, applied });
                }
                Err(error) => {
                    tracing::warn!(
                        unit = %unit,
                        error = %error,
                        "unit failed, continuing with next unit"
                    );
                    metrics.record_unit_failure(&error);
                    outcomes.push(UnitOutcome::Failed {
                        unit: unit.clone(),
                        error,
                    });
                }
            }
        }

        metrics.log(&run_id);

        RunReport {
            run_id,
            outcomes,
            metrics,
        }
    }
}

/// Why an accepted entry does not belong to `unit`, if it doesn't
fn outside_unit(unit: &UnitOfWork, entry: &NormalizedEntry) -> Option<EntryRejection> {
    if entry.entity != unit.entity {
        return Some(EntryRejection::EntityMismatch(entry.entity.to_string()));
    }
    if !unit.period.contains(entry.accrual_date) {
        return Some(EntryRejection::OutsidePeriod(entry.accrual_date));
    }
    None
}

// ============================================================================
// TESTS
// ============================================================================
