// 🗂️ Account Categorizer - account label → statement group
//
// Bands are data, not logic: an ordered table of prefix/pattern rules,
// first match wins, anything unmatched lands in Other (split by nature).

use crate::entry::{account_code, CategorizedEntry, ClassifiedEntry, Nature};
use crate::error::ConfigError;
use anyhow::{Context as AnyhowContext, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// ============================================================================
// STATEMENT GROUPS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementGroup {
    Revenue,
    RevenueDeductions,
    TaxesOnRevenue,
    Cogs,
    PersonnelExpense,
    AdminExpense,
    OperatingExpense,
    FinancialExpense,
    FinancialRevenue,
    Other,
}

impl StatementGroup {
    pub const ALL: [StatementGroup; 10] = [
        StatementGroup::Revenue,
        StatementGroup::RevenueDeductions,
        StatementGroup::TaxesOnRevenue,
        StatementGroup::Cogs,
        StatementGroup::PersonnelExpense,
        StatementGroup::AdminExpense,
        StatementGroup::OperatingExpense,
        StatementGroup::FinancialExpense,
        StatementGroup::FinancialRevenue,
        StatementGroup::Other,
    ];

    /// Display label; Other is sub-labelled by nature
    pub fn label(&self, nature: Nature) -> &'static str {
        match self {
            StatementGroup::Revenue => "Gross Revenue",
            StatementGroup::RevenueDeductions => "Revenue Deductions",
            StatementGroup::TaxesOnRevenue => "Taxes on Revenue",
            StatementGroup::Cogs => "Cost of Goods Sold",
            StatementGroup::PersonnelExpense => "Personnel Expenses",
            StatementGroup::AdminExpense => "Administrative Expenses",
            StatementGroup::OperatingExpense => "Operating Expenses",
            StatementGroup::FinancialExpense => "Financial Expenses",
            StatementGroup::FinancialRevenue => "Financial Revenue",
            StatementGroup::Other => match nature {
                Nature::Revenue => "Other Revenue",
                Nature::Expense => "Other Expense",
            },
        }
    }
}

// ============================================================================
// RULE DEFINITION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRule {
    /// Rule ID for tracking
    pub id: String,

    pub group: StatementGroup,

    /// Account code prefixes ("205-0", "400-"); empty means name-only rule
    #[serde(default)]
    pub prefixes: Vec<String>,

    /// Regex the account name must match
    #[serde(default)]
    pub name_pattern: Option<String>,

    /// Regex the account name must NOT match
    #[serde(default)]
    pub exclude_pattern: Option<String>,
}

impl CategoryRule {
    pub fn new(id: &str, group: StatementGroup, prefixes: &[&str]) -> Self {
        CategoryRule {
            id: id.to_string(),
            group,
            prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
            name_pattern: None,
            exclude_pattern: None,
        }
    }

    pub fn with_name_pattern(mut self, pattern: &str) -> Self {
        self.name_pattern = Some(pattern.to_string());
        self
    }

    pub fn with_exclude_pattern(mut self, pattern: &str) -> Self {
        self.exclude_pattern = Some(pattern.to_string());
        self
    }
}

const DEDUCTION_NAMES: &str = r"(?i)cancel|devol|return|revers|estorn";

/// Built-in band table
pub fn default_rules() -> Vec<CategoryRule> {
    use StatementGroup::*;
    vec![
        CategoryRule::new("revenue_billing", Revenue, &["102-1"])
            .with_exclude_pattern(DEDUCTION_NAMES),
        CategoryRule::new("revenue_other", Revenue, &["302-1"]),
        CategoryRule::new("deductions_by_name", RevenueDeductions, &[])
            .with_name_pattern(DEDUCTION_NAMES),
        CategoryRule::new("deductions_by_band", RevenueDeductions, &["300-9", "431-9"]),
        CategoryRule::new("taxes_on_revenue", TaxesOnRevenue, &["205-0"]),
        CategoryRule::new("cogs", Cogs, &["400-0"])
            .with_name_pattern(r"(?i)custo.*mercadoria|cost of goods"),
        CategoryRule::new("cost_band_other", OperatingExpense, &["400-"]),
        CategoryRule::new("personnel", PersonnelExpense, &["201-", "202-", "203-", "415-", "417-"]),
        CategoryRule::new("administrative", AdminExpense, &["420-", "424-", "425-", "434-"]),
        CategoryRule::new("operating", OperatingExpense, &["421-", "422-", "409-"]),
        CategoryRule::new("financial_expense", FinancialExpense, &["432-", "431-5"]),
        CategoryRule::new("financial_revenue", FinancialRevenue, &["303-4"])
            .with_name_pattern(r"(?i)desconto.*obtid|discount.*received"),
    ]
}

/// "400-" covers "400-1"; "431-5" covers "431-5" and "431-5-2" but not "431-55"
fn code_has_prefix(code: &str, prefix: &str) -> bool {
    match code.strip_prefix(prefix) {
        Some(rest) => prefix.ends_with('-') || rest.is_empty() || rest.starts_with('-'),
        None => false,
    }
}

struct CompiledRule {
    rule: CategoryRule,
    name_pattern: Option<Regex>,
    exclude_pattern: Option<Regex>,
}

fn compile(pattern: &Option<String>) -> Result<Option<Regex>, ConfigError> {
    pattern
        .as_deref()
        .map(|p| {
            Regex::new(p).map_err(|source| ConfigError::Pattern {
                pattern: p.to_string(),
                source,
            })
        })
        .transpose()
}

impl CompiledRule {
    fn matches(&self, code: Option<&str>, name: &str) -> bool {
        let prefix_ok = if self.rule.prefixes.is_empty() {
            // Name-only rules need a pattern to mean anything
            self.name_pattern.is_some()
        } else {
            code.map_or(false, |c| self.rule.prefixes.iter().any(|p| code_has_prefix(c, p)))
        };

        prefix_ok
            && self.name_pattern.as_ref().map_or(true, |re| re.is_match(name))
            && self.exclude_pattern.as_ref().map_or(true, |re| !re.is_match(name))
    }
}

// ============================================================================
// CATEGORY TABLE
// ============================================================================

pub struct CategoryTable {
    rules: Vec<CompiledRule>,
}

impl CategoryTable {
    /// Compile a table; order is evaluation order
    pub fn from_rules(rules: Vec<CategoryRule>) -> Result<Self, ConfigError> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                Ok(CompiledRule {
                    name_pattern: compile(&rule.name_pattern)?,
                    exclude_pattern: compile(&rule.exclude_pattern)?,
                    rule,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(CategoryTable { rules })
    }

    /// Load an override table from a JSON array of rules
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read category table: {:?}", path.as_ref()))?;

        let rules: Vec<CategoryRule> = serde_json::from_str(&content)
            .context("Failed to parse category table JSON")?;

        Ok(CategoryTable::from_rules(rules)?)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Group plus the id of the rule that matched (None → Other)
    pub fn lookup(&self, label: &str) -> (StatementGroup, Option<&str>) {
        let code = account_code(label);
        self.rules
            .iter()
            .find(|r| r.matches(code.as_deref(), label))
            .map(|r| (r.rule.group, Some(r.rule.id.as_str())))
            .unwrap_or((StatementGroup::Other, None))
    }

    pub fn group_for(&self, entry: &ClassifiedEntry) -> StatementGroup {
        let label = entry.entry.raw_account_label().unwrap_or("");
        let (group, rule) = self.lookup(label);
        if rule.is_none() {
            tracing::debug!(
                account = label,
                nature = entry.nature.as_str(),
                "no category rule matched, using other"
            );
        }
        group
    }

    pub fn categorize(&self, entry: ClassifiedEntry) -> CategorizedEntry {
        let group = self.group_for(&entry);
        CategorizedEntry {
            classified: entry,
            group,
        }
    }
}

impl Default for CategoryTable {
    fn default() -> Self {
        CategoryTable::from_rules(default_rules()).expect("built-in category patterns")
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::ChartOfAccounts;
    use crate::classifier::NatureClassifier;
    use crate::entry::RawEntry;
    use crate::normalizer::Normalizer;

    fn create_test_entry(label: &str) -> ClassifiedEntry {
        let raw = RawEntry::new("26888098000159", "2025-03-10", "100,00").with_account(None, label);
        let normalized = Normalizer::default().normalize(&raw).unwrap();
        NatureClassifier::new().classify_entry(normalized, &ChartOfAccounts::new())
    }

    fn group(label: &str) -> StatementGroup {
        CategoryTable::default().group_for(&create_test_entry(label))
    }

    #[test]
    fn test_taxes_on_revenue() {
        assert_eq!(group("205-0 ICMS"), StatementGroup::TaxesOnRevenue);
    }

    #[test]
    fn test_revenue_unless_cancelled() {
        assert_eq!(group("102-1 Vendas de Mercadorias"), StatementGroup::Revenue);
        assert_eq!(group("102-1 Vendas Canceladas"), StatementGroup::RevenueDeductions);
        assert_eq!(group("Devoluções de vendas"), StatementGroup::RevenueDeductions);
        assert_eq!(group("300-9 Abatimentos"), StatementGroup::RevenueDeductions);
    }

    #[test]
    fn test_cost_band() {
        assert_eq!(group("400-0 Custo das Mercadorias Vendidas"), StatementGroup::Cogs);
        assert_eq!(group("400-0 Fretes"), StatementGroup::OperatingExpense);
        assert_eq!(group("400-3 Embalagens"), StatementGroup::OperatingExpense);
    }

    #[test]
    fn test_expense_bands() {
        assert_eq!(group("201-1 Salários"), StatementGroup::PersonnelExpense);
        assert_eq!(group("420-1 Aluguel"), StatementGroup::AdminExpense);
        assert_eq!(group("421-2 Marketing"), StatementGroup::OperatingExpense);
        assert_eq!(group("432-1 Juros"), StatementGroup::FinancialExpense);
        assert_eq!(group("431-5 Tarifas Bancárias"), StatementGroup::FinancialExpense);
        assert_eq!(group("303-4 Descontos Obtidos"), StatementGroup::FinancialRevenue);
    }

    #[test]
    fn test_prefix_respects_segment_boundary() {
        assert!(code_has_prefix("431-5", "431-5"));
        assert!(code_has_prefix("400-1", "400-"));
        assert!(!code_has_prefix("431-55", "431-5"));
        assert!(!code_has_prefix("4001-1", "400"));
    }

    #[test]
    fn test_unmatched_is_other_split_by_nature() {
        let entry = create_test_entry("999-9 Diversos");
        let categorized = CategoryTable::default().categorize(entry);

        assert_eq!(categorized.group, StatementGroup::Other);
        // band 999 classifies as expense
        assert_eq!(categorized.group.label(categorized.nature()), "Other Expense");
        assert_eq!(StatementGroup::Other.label(Nature::Revenue), "Other Revenue");
    }

    #[test]
    fn test_table_from_json_overrides_defaults() {
        let json = r#"[
            {"id": "royalties", "group": "financial_revenue", "prefixes": ["999-"]}
        ]"#;
        let rules: Vec<CategoryRule> = serde_json::from_str(json).unwrap();
        let table = CategoryTable::from_rules(rules).unwrap();

        assert_eq!(table.rule_count(), 1);
        assert_eq!(
            table.lookup("999-1 Royalties"),
            (StatementGroup::FinancialRevenue, Some("royalties"))
        );
        assert_eq!(table.lookup("205-0 ICMS").0, StatementGroup::Other);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let rule =
            CategoryRule::new("broken", StatementGroup::Other, &[]).with_name_pattern("(unclosed");
        assert!(matches!(
            CategoryTable::from_rules(vec![rule]),
            Err(ConfigError::Pattern { .. })
        ));
    }
}
