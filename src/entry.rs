// 🧾 Ledger Entries - one record per ERP transaction/installment
// Each pipeline stage produces a new immutable value from the previous one:
//   RawEntry → NormalizedEntry → ClassifiedEntry → CategorizedEntry

use crate::categorizer::StatementGroup;
use crate::classifier::RuleId;
use crate::error::EntryRejection;
use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

// ============================================================================
// RAW INPUT
// ============================================================================

/// A field that arrives either as a spreadsheet number or as text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

/// Explicit revenue/expense marker supplied by the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeFlag {
    /// true = receivable (revenue), false = payable (expense)
    Bool(bool),
    Text(String),
}

/// RawEntry - semi-structured record exported by the accounting service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEntry {
    pub accrual_date: Option<RawValue>,
    pub settlement_date: Option<RawValue>,
    pub amount: Option<RawValue>,

    pub account_plan_id: Option<String>,
    pub account_plan_name: Option<String>,
    pub debit_account: Option<String>,
    pub credit_account: Option<String>,

    pub type_flag: Option<TypeFlag>,
    /// Free-text "plan type" (e.g. "A receber", "Payable")
    pub plan_type: Option<String>,
    /// Free-text "title type"
    pub title_type: Option<String>,

    pub entity_id: String,
    #[serde(alias = "description")]
    pub memo: Option<String>,
    pub reference_id: Option<String>,
    pub bank_account: Option<String>,
}

impl RawEntry {
    /// Create a raw entry with the fields every export provides
    pub fn new(
        entity_id: &str,
        accrual_date: impl Into<RawValue>,
        amount: impl Into<RawValue>,
    ) -> Self {
        RawEntry {
            entity_id: entity_id.to_string(),
            accrual_date: Some(accrual_date.into()),
            amount: Some(amount.into()),
            ..Default::default()
        }
    }

    pub fn with_settlement(mut self, date: impl Into<RawValue>) -> Self {
        self.settlement_date = Some(date.into());
        self
    }

    pub fn with_account(mut self, id: Option<&str>, name: &str) -> Self {
        self.account_plan_id = id.map(str::to_string);
        self.account_plan_name = Some(name.to_string());
        self
    }

    pub fn with_debit_credit(mut self, debit: &str, credit: &str) -> Self {
        self.debit_account = Some(debit.to_string());
        self.credit_account = Some(credit.to_string());
        self
    }

    pub fn with_type_flag(mut self, flag: TypeFlag) -> Self {
        self.type_flag = Some(flag);
        self
    }

    pub fn with_plan_type(mut self, plan_type: &str) -> Self {
        self.plan_type = Some(plan_type.to_string());
        self
    }

    pub fn with_memo(mut self, memo: &str) -> Self {
        self.memo = Some(memo.to_string());
        self
    }

    pub fn with_reference(mut self, reference: &str) -> Self {
        self.reference_id = Some(reference.to_string());
        self
    }

    pub fn with_bank_account(mut self, bank_account: &str) -> Self {
        self.bank_account = Some(bank_account.to_string());
        self
    }
}

// ============================================================================
// ENTITY IDENTIFIER
// ============================================================================

/// Canonical 14-digit legal entity code (CNPJ)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub const LEN: usize = 14;

    /// Strip every non-digit and require exactly 14 digits
    pub fn parse(raw: &str) -> Result<Self, EntryRejection> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() != Self::LEN {
            return Err(EntryRejection::InvalidEntityId(raw.to_string()));
        }
        Ok(EntityId(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// CALENDAR MONTH
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn of(date: NaiveDate) -> Self {
        YearMonth {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Persisted statement rows are dated on the first day of their month
    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl Serialize for YearMonth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ============================================================================
// NATURE / DIRECTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nature {
    Revenue,
    Expense,
}

impl Nature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Nature::Revenue => "revenue",
            Nature::Expense => "expense",
        }
    }

    /// Cash direction is always derived from nature, never classified on its own
    pub fn direction(&self) -> Direction {
        match self {
            Nature::Revenue => Direction::Inflow,
            Nature::Expense => Direction::Outflow,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inflow,
    Outflow,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inflow => "inflow",
            Direction::Outflow => "outflow",
        }
    }

    pub fn nature(&self) -> Nature {
        match self {
            Direction::Inflow => Nature::Revenue,
            Direction::Outflow => Nature::Expense,
        }
    }
}

// ============================================================================
// STAGE OUTPUTS
// ============================================================================

/// NormalizedEntry - typed values; amount ≠ 0 and accrual date resolved
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedEntry {
    pub entity: EntityId,
    pub accrual_date: NaiveDate,
    pub settlement_date: Option<NaiveDate>,
    pub amount: Decimal,

    pub account_plan_id: Option<String>,
    pub account_plan_name: Option<String>,
    pub debit_account: Option<String>,
    pub credit_account: Option<String>,

    pub type_flag: Option<TypeFlag>,
    pub plan_type: Option<String>,
    pub title_type: Option<String>,

    pub memo: Option<String>,
    pub reference_id: Option<String>,
    pub bank_account: Option<String>,
}

impl NormalizedEntry {
    /// Account label as exported: plan name, then debit, then credit account
    pub fn raw_account_label(&self) -> Option<&str> {
        self.account_plan_name
            .as_deref()
            .or(self.debit_account.as_deref())
            .or(self.credit_account.as_deref())
    }

    /// Numeric account code extracted from the plan name (e.g. "205-0")
    pub fn account_code(&self) -> Option<String> {
        self.account_plan_name.as_deref().and_then(account_code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedEntry {
    pub entry: NormalizedEntry,
    pub nature: Nature,
    /// Cascade rule that decided the nature
    pub rule: RuleId,
}

impl ClassifiedEntry {
    pub fn direction(&self) -> Direction {
        self.nature.direction()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorizedEntry {
    pub classified: ClassifiedEntry,
    pub group: StatementGroup,
}

impl CategorizedEntry {
    pub fn entry(&self) -> &NormalizedEntry {
        &self.classified.entry
    }

    pub fn nature(&self) -> Nature {
        self.classified.nature
    }
}

// ============================================================================
// ACCOUNT CODES
// ============================================================================

static ACCOUNT_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{2,}(?:\s*-\s*\d+)*)").expect("static regex"));

static ACCOUNT_BAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{3})-(\d)").expect("static regex"));

/// Leading account code of a label, whitespace removed ("205-0 ICMS" → "205-0")
pub fn account_code(label: &str) -> Option<String> {
    ACCOUNT_CODE
        .captures(label.trim())
        .map(|caps| caps[1].chars().filter(|c| !c.is_whitespace()).collect())
}

/// Three-digit band of a label in `NNN-N` form ("432-1 Juros" → 432)
pub fn account_band(label: &str) -> Option<u32> {
    ACCOUNT_BAND
        .captures(label.trim())
        .and_then(|caps| caps[1].parse().ok())
}

/// Trim, collapse inner whitespace and lowercase
pub fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_strips_punctuation() {
        let id = EntityId::parse("26.888.098/0001-59").unwrap();
        assert_eq!(id.as_str(), "26888098000159");
    }

    #[test]
    fn test_entity_id_rejects_wrong_length() {
        assert_eq!(
            EntityId::parse("123.456"),
            Err(EntryRejection::InvalidEntityId("123.456".to_string()))
        );
    }

    #[test]
    fn test_account_code_extraction() {
        assert_eq!(account_code("205-0 ICMS"), Some("205-0".to_string()));
        assert_eq!(account_code("  102-1 Vendas de Mercadorias"), Some("102-1".to_string()));
        assert_eq!(account_code("Vendas"), None);
        assert_eq!(account_band("432-1 Juros Pagos"), Some(432));
        assert_eq!(account_band("43-1 Juros"), None);
    }

    #[test]
    fn test_year_month_display_and_first_day() {
        let ym = YearMonth::of(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap());
        assert_eq!(ym.to_string(), "2025-03");
        assert_eq!(ym.first_day(), NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
    }

    #[test]
    fn test_direction_follows_nature() {
        assert_eq!(Nature::Revenue.direction(), Direction::Inflow);
        assert_eq!(Nature::Expense.direction(), Direction::Outflow);
    }

    #[test]
    fn test_normalize_label() {
        assert_eq!(normalize_label("  Vendas   de  Produtos "), "vendas de produtos");
    }
}
