// 📈 Run Metrics - counters for the structured log/metrics stream
//
// Rejected entries, fallback classifications by rule, failed units and
// rejected persistence batches. Units merge into a run total.

use crate::classifier::RuleId;
use crate::entry::RawEntry;
use crate::error::{EntryRejection, SourceError};
use crate::reconciliation::ApplyReport;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunMetrics {
    pub entries_seen: usize,
    pub entries_accepted: usize,
    /// Rejections by reason code ("zero_amount", ...)
    pub entries_rejected: BTreeMap<String, usize>,
    /// Non-authoritative classifications by the rule that decided them
    pub fallbacks: BTreeMap<RuleId, usize>,

    pub units_completed: usize,
    pub units_failed: usize,
    pub units_timed_out: usize,

    pub batches_written: usize,
    pub batches_retried: usize,
    pub batches_rejected: usize,
    pub rows_written: usize,
    pub rows_pruned: usize,
    pub prunes_failed: usize,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rejection(&mut self, reason: &EntryRejection) {
        *self.entries_rejected.entry(reason.code().to_string()).or_insert(0) += 1;
    }

    pub fn record_classification(&mut self, rule: RuleId) {
        if !rule.is_authoritative() {
            *self.fallbacks.entry(rule).or_insert(0) += 1;
        }
    }

    pub fn record_unit_failure(&mut self, error: &SourceError) {
        self.units_failed += 1;
        if matches!(error, SourceError::UpstreamTimeout { .. }) {
            self.units_timed_out += 1;
        }
    }

    pub fn record_apply(&mut self, report: &ApplyReport) {
        self.batches_written += report.batches_written;
        self.batches_retried += report.batches_retried;
        self.batches_rejected += report.batches_rejected;
        self.rows_written += report.rows_written;
        self.rows_pruned += report.rows_pruned;
        if report.prune_failed {
            self.prunes_failed += 1;
        }
    }

    /// Rows the source could not attach to any unit (no valid entity id)
    pub fn record_unassigned(&mut self, rows: &[RawEntry]) {
        self.entries_seen += rows.len();
        for row in rows {
            self.record_rejection(&EntryRejection::InvalidEntityId(row.entity_id.clone()));
        }
    }

    pub fn rejected_total(&self) -> usize {
        self.entries_rejected.values().sum()
    }

    pub fn fallback_total(&self) -> usize {
        self.fallbacks.values().sum()
    }

    pub fn fallbacks_for(&self, rule: RuleId) -> usize {
        self.fallbacks.get(&rule).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &RunMetrics) {
        self.entries_seen += other.entries_seen;
        self.entries_accepted += other.entries_accepted;
        for (code, count) in &other.entries_rejected {
            *self.entries_rejected.entry(code.clone()).or_insert(0) += count;
        }
        for (rule, count) in &other.fallbacks {
            *self.fallbacks.entry(*rule).or_insert(0) += count;
        }
        self.units_completed += other.units_completed;
        self.units_failed += other.units_failed;
        self.units_timed_out += other.units_timed_out;
        self.batches_written += other.batches_written;
        self.batches_retried += other.batches_retried;
        self.batches_rejected += other.batches_rejected;
        self.rows_written += other.rows_written;
        self.rows_pruned += other.rows_pruned;
        self.prunes_failed += other.prunes_failed;
    }

    /// Emit the counters as one structured log event
    pub fn log(&self, run_id: &str) {
        tracing::info!(
            run_id,
            entries_seen = self.entries_seen,
            entries_accepted = self.entries_accepted,
            entries_rejected = self.rejected_total(),
            fallbacks = self.fallback_total(),
            defaulted = self.fallbacks_for(RuleId::Default),
            units_completed = self.units_completed,
            units_failed = self.units_failed,
            units_timed_out = self.units_timed_out,
            batches_rejected = self.batches_rejected,
            rows_written = self.rows_written,
            rows_pruned = self.rows_pruned,
            prunes_failed = self.prunes_failed,
            "run metrics"
        );
    }

    pub fn summary(&self) -> String {
        format!(
            "Entries: {} seen, {} accepted, {} rejected | Fallbacks: {} ({} defaulted) | \
             Units: {} ok, {} failed | Batches: {} written, {} rejected",
            self.entries_seen,
            self.entries_accepted,
            self.rejected_total(),
            self.fallback_total(),
            self.fallbacks_for(RuleId::Default),
            self.units_completed,
            self.units_failed,
            self.batches_written,
            self.batches_rejected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_reason_and_rule() {
        let mut metrics = RunMetrics::new();
        metrics.record_rejection(&EntryRejection::ZeroAmount);
        metrics.record_rejection(&EntryRejection::ZeroAmount);
        metrics.record_rejection(&EntryRejection::MissingAccrualDate);
        metrics.record_classification(RuleId::ExplicitFlag);
        metrics.record_classification(RuleId::Keyword);
        metrics.record_classification(RuleId::Default);

        assert_eq!(metrics.entries_rejected["zero_amount"], 2);
        assert_eq!(metrics.rejected_total(), 3);
        assert_eq!(metrics.fallback_total(), 2);
        assert_eq!(metrics.fallbacks_for(RuleId::ExplicitFlag), 0);
        assert_eq!(metrics.fallbacks_for(RuleId::Default), 1);
    }

    #[test]
    fn test_unit_failures() {
        let mut metrics = RunMetrics::new();
        metrics.record_unit_failure(&SourceError::UpstreamTimeout { attempts: 30 });
        metrics.record_unit_failure(&SourceError::SessionExpired);

        assert_eq!(metrics.units_failed, 2);
        assert_eq!(metrics.units_timed_out, 1);
    }

    #[test]
    fn test_merge_adds_everything() {
        let mut a = RunMetrics::new();
        a.entries_seen = 3;
        a.record_rejection(&EntryRejection::ZeroAmount);
        a.record_classification(RuleId::CodeBand);

        let mut b = RunMetrics::new();
        b.entries_seen = 2;
        b.record_rejection(&EntryRejection::ZeroAmount);
        b.record_apply(&ApplyReport {
            batches_written: 1,
            rows_written: 4,
            ..Default::default()
        });

        a.merge(&b);

        assert_eq!(a.entries_seen, 5);
        assert_eq!(a.entries_rejected["zero_amount"], 2);
        assert_eq!(a.fallbacks_for(RuleId::CodeBand), 1);
        assert_eq!(a.rows_written, 4);
        assert!(a.summary().contains("5 seen"));
    }

    #[test]
    fn test_unassigned_rows_count_as_rejections() {
        let mut metrics = RunMetrics::new();
        let stray = vec![
            RawEntry::new("", "2025-03-10", "10"),
            RawEntry::new("123", "2025-03-10", "10"),
        ];

        metrics.record_unassigned(&stray);

        assert_eq!(metrics.entries_seen, 2);
        assert_eq!(metrics.entries_rejected["invalid_entity_id"], 2);
        assert_eq!(metrics.entries_accepted, 0);
    }

    #[test]
    fn test_serializes_rule_keys_as_names() {
        let mut metrics = RunMetrics::new();
        metrics.record_classification(RuleId::DebitCreditSide);
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["fallbacks"]["debit_credit_side"], 1);
    }
}
