// Ledger Statements - Core Library
// ERP ledger entries → monthly DRE (accrual P&L) and DFC (cash flow) rows
// Exposes all modules for use in the import binary and tests

pub mod error;
pub mod entry;
pub mod normalizer;     // Entry Normalizer
pub mod chart;          // Chart of accounts (read-only directory)
pub mod classifier;     // Nature Classifier - ordered rule cascade
pub mod categorizer;    // Account Categorizer - band table
pub mod aggregator;     // Period Aggregator + consolidation
pub mod reconciliation; // Reconciliation Planner + batch applier
pub mod db;             // SQLite persistence collaborator
pub mod source;         // Boundary: sources, session, report polling
pub mod metrics;
pub mod config;
pub mod pipeline;

// Re-export commonly used types
pub use error::{ConfigError, EntryRejection, PersistenceError, SourceError};
pub use entry::{
    CategorizedEntry, ClassifiedEntry, Direction, EntityId, Nature, NormalizedEntry,
    RawEntry, RawValue, TypeFlag, YearMonth,
};
pub use normalizer::{Normalizer, NormalizeOutcome, parse_amount, parse_date};
pub use chart::{AccountDirectory, ChartAccount, ChartAccountType, ChartOfAccounts};
pub use classifier::{Classification, KeywordSet, NatureClassifier, NatureRule, RuleId};
pub use categorizer::{CategoryRule, CategoryTable, StatementGroup};
pub use aggregator::{
    accumulate, aggregate, consolidate, AggregatedRecord, Aggregation, ConsolidatedStatements,
    DfcKey, DfcRecord, DreKey, DreRecord, Statements,
};
pub use reconciliation::{
    apply_plan, ApplyReport, Keyed, NaturalKey, PlanScope, ReconciliationPlanner,
    UpsertBatch, UpsertPlan, UpsertRow, UpsertSink,
};
pub use db::{setup_database, RunEvent, SqliteStore, StoredRow};
pub use source::{
    poll_until_ready, CsvEntrySource, EntrySource, Period, PollPolicy, PolledSource,
    ReportClient, ReportStatus, Session, UnitOfWork,
};
pub use metrics::RunMetrics;
pub use config::PipelineConfig;
pub use pipeline::{Pipeline, RunReport, UnitOutcome, UnitReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
