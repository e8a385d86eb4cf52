// 🚨 Error Taxonomy - typed failures for each pipeline boundary
//
// Entry-level problems never abort a unit of work: they are counted and the
// entry is dropped. Boundary failures (source, persistence) are surfaced as
// values so the runner can decide to continue with the next unit.

use chrono::NaiveDate;
use thiserror::Error;

/// Why the normalizer refused an entry (MalformedEntry).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Error)]
pub enum EntryRejection {
    #[error("amount is not numeric: {0:?}")]
    UnparsableAmount(String),

    #[error("amount is zero")]
    ZeroAmount,

    #[error("accrual date is missing")]
    MissingAccrualDate,

    #[error("date is not parsable: {0:?}")]
    UnparsableDate(String),

    #[error("entity identifier must have 14 digits: {0:?}")]
    InvalidEntityId(String),

    #[error("entry belongs to entity {0}, not to the unit being processed")]
    EntityMismatch(String),

    #[error("accrual date {0} is outside the unit period")]
    OutsidePeriod(NaiveDate),
}

impl EntryRejection {
    /// Stable reason code used as a metrics key
    pub fn code(&self) -> &'static str {
        match self {
            EntryRejection::UnparsableAmount(_) => "unparsable_amount",
            EntryRejection::ZeroAmount => "zero_amount",
            EntryRejection::MissingAccrualDate => "missing_accrual_date",
            EntryRejection::UnparsableDate(_) => "unparsable_date",
            EntryRejection::InvalidEntityId(_) => "invalid_entity_id",
            EntryRejection::EntityMismatch(_) => "entity_mismatch",
            EntryRejection::OutsidePeriod(_) => "outside_period",
        }
    }
}

/// Failures raised by the collaborator that supplies raw entries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source report not ready after {attempts} attempts")]
    UpstreamTimeout { attempts: u32 },

    #[error("source report failed: {0}")]
    ReportFailed(String),

    #[error("session expired")]
    SessionExpired,

    #[error("invalid report status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("source transport error: {0}")]
    Transport(String),
}

/// Failures raised by the persistence collaborator.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("batch of {rows} rows rejected: {reason}")]
    RejectedBatch { rows: usize, reason: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}
