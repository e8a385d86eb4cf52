// ⚙️ Pipeline configuration
//
// Loading order: defaults → optional JSON file → LEDGER_* environment overrides.

use crate::categorizer::CategoryTable;
use crate::classifier::{KeywordSet, NatureClassifier, RuleId};
use crate::error::ConfigError;
use crate::normalizer::{Normalizer, DEFAULT_MAX_TEXT_LEN};
use crate::reconciliation::{ReconciliationPlanner, DEFAULT_BATCH_SIZE};
use crate::source::PollPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const ENV_BATCH_SIZE: &str = "LEDGER_BATCH_SIZE";
pub const ENV_MAX_TEXT_LEN: &str = "LEDGER_MAX_TEXT_LEN";
pub const ENV_POLL_ATTEMPTS: &str = "LEDGER_POLL_ATTEMPTS";
pub const ENV_POLL_INTERVAL_MS: &str = "LEDGER_POLL_INTERVAL_MS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Rows per upsert batch
    pub batch_size: usize,

    /// Free-text fields are cut to this many characters
    pub max_text_len: usize,

    pub poll: PollPolicy,

    /// Classifier rules switched off for audit runs
    pub disabled_rules: Vec<RuleId>,

    /// JSON band table replacing the built-in one
    pub category_bands: Option<PathBuf>,

    pub keywords: KeywordSet,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_text_len: DEFAULT_MAX_TEXT_LEN,
            poll: PollPolicy::default(),
            disabled_rules: Vec::new(),
            category_bands: None,
            keywords: KeywordSet::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults, then the file (if any), then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.with_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Defaults with environment overrides only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply LEDGER_* overrides from any key lookup
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parse_override(&lookup, ENV_BATCH_SIZE)? {
            self.batch_size = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_MAX_TEXT_LEN)? {
            self.max_text_len = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_POLL_ATTEMPTS)? {
            self.poll.max_attempts = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_POLL_INTERVAL_MS)? {
            self.poll.interval_ms = value;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "0"));
        }
        if self.max_text_len == 0 {
            return Err(invalid("max_text_len", "0"));
        }
        if self.disabled_rules.contains(&RuleId::Default) {
            return Err(invalid("disabled_rules", RuleId::Default.as_str()));
        }
        Ok(())
    }

    // ========================================================================
    // STAGE CONSTRUCTION
    // ========================================================================

    pub fn normalizer(&self) -> Normalizer {
        Normalizer::new(self.max_text_len)
    }

    pub fn classifier(&self) -> NatureClassifier {
        NatureClassifier::with_keywords(self.keywords.clone()).without(&self.disabled_rules)
    }

    pub fn category_table(&self) -> anyhow::Result<CategoryTable> {
        match &self.category_bands {
            Some(path) => CategoryTable::from_file(path),
            None => Ok(CategoryTable::default()),
        }
    }

    pub fn planner(&self) -> ReconciliationPlanner {
        ReconciliationPlanner::with_batch_size(self.batch_size)
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_override<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(key, &raw)),
    }
}
