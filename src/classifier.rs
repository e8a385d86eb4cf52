// 🏷️ Nature Classifier - revenue vs. expense as an ordered rule cascade
//
// Rules are data: an ordered list of strategies, first definitive answer wins,
// no backtracking. Any rule can be switched off for an audit run except the
// terminal default, which always answers "expense" and always logs.
//
// Cascade:
//   1. explicit type flag from the source (authoritative)
//   2. chart of accounts by plan id
//   3. chart of accounts by normalized account name
//   4. free-text plan/title type
//   5. credit side populated, debit side empty (and vice versa)
//   6. numeric code band of the account label (NNN-N)
//   7. keywords in the account name
//   8. default: expense + warning

use crate::chart::{AccountDirectory, ChartAccountType};
use crate::entry::{account_band, ClassifiedEntry, Nature, NormalizedEntry, TypeFlag};
use serde::{Deserialize, Serialize};

// ============================================================================
// RULE IDENTIFIERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    ExplicitFlag,
    ChartById,
    ChartByName,
    PlanTypeText,
    DebitCreditSide,
    CodeBand,
    Keyword,
    Default,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::ExplicitFlag => "explicit_flag",
            RuleId::ChartById => "chart_by_id",
            RuleId::ChartByName => "chart_by_name",
            RuleId::PlanTypeText => "plan_type_text",
            RuleId::DebitCreditSide => "debit_credit_side",
            RuleId::CodeBand => "code_band",
            RuleId::Keyword => "keyword",
            RuleId::Default => "default",
        }
    }

    /// Position in the cascade (1-based)
    pub fn position(&self) -> u8 {
        match self {
            RuleId::ExplicitFlag => 1,
            RuleId::ChartById => 2,
            RuleId::ChartByName => 3,
            RuleId::PlanTypeText => 4,
            RuleId::DebitCreditSide => 5,
            RuleId::CodeBand => 6,
            RuleId::Keyword => 7,
            RuleId::Default => 8,
        }
    }

    /// Only the source's own flag is trusted without a fallback record
    pub fn is_authoritative(&self) -> bool {
        matches!(self, RuleId::ExplicitFlag)
    }
}

// ============================================================================
// RULE DATA
// ============================================================================

/// Inclusive band of three-digit account codes mapped to a nature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeBand {
    pub from: u32,
    pub to: u32,
    pub nature: Nature,
}

impl CodeBand {
    pub fn new(from: u32, to: u32, nature: Nature) -> Self {
        CodeBand { from, to, nature }
    }

    pub fn contains(&self, band: u32) -> bool {
        (self.from..=self.to).contains(&band)
    }
}

/// 100–199 and 300–399 are revenue; 200–299 and 400+ are expense
pub fn default_code_bands() -> Vec<CodeBand> {
    vec![
        CodeBand::new(100, 199, Nature::Revenue),
        CodeBand::new(200, 299, Nature::Expense),
        CodeBand::new(300, 399, Nature::Revenue),
        CodeBand::new(400, 999, Nature::Expense),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordSet {
    pub revenue: Vec<String>,
    pub expense: Vec<String>,
    /// Markers that stop a revenue keyword from deciding ("cancelled", "estorno")
    pub reversal: Vec<String>,
}

impl Default for KeywordSet {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|w| w.to_string()).collect();
        KeywordSet {
            revenue: words(&[
                "revenue", "sale", "billing", "receita", "venda", "faturamento",
                "recebimento", "rendimento", "receber",
            ]),
            expense: words(&[
                "expense", "cost", "payment", "payroll", "supplier", "despesa", "custo",
                "pagamento", "pagar", "salario", "salário", "fornecedor", "compra",
            ]),
            reversal: words(&["cancel", "revers", "estorn", "devol"]),
        }
    }
}

// ============================================================================
// STRATEGIES
// ============================================================================

/// One step of the cascade
#[derive(Debug, Clone, PartialEq)]
pub enum NatureRule {
    ExplicitFlag,
    ChartById,
    ChartByName,
    PlanTypeText,
    DebitCreditSide,
    CodeBand(Vec<CodeBand>),
    Keyword(KeywordSet),
}

impl NatureRule {
    pub fn id(&self) -> RuleId {
        match self {
            NatureRule::ExplicitFlag => RuleId::ExplicitFlag,
            NatureRule::ChartById => RuleId::ChartById,
            NatureRule::ChartByName => RuleId::ChartByName,
            NatureRule::PlanTypeText => RuleId::PlanTypeText,
            NatureRule::DebitCreditSide => RuleId::DebitCreditSide,
            NatureRule::CodeBand(_) => RuleId::CodeBand,
            NatureRule::Keyword(_) => RuleId::Keyword,
        }
    }

    /// Definitive answer, or None to hand the entry to the next rule
    pub fn decide<D: AccountDirectory + ?Sized>(
        &self,
        entry: &NormalizedEntry,
        chart: &D,
    ) -> Option<Nature> {
        match self {
            NatureRule::ExplicitFlag => match entry.type_flag.as_ref()? {
                TypeFlag::Bool(true) => Some(Nature::Revenue),
                TypeFlag::Bool(false) => Some(Nature::Expense),
                TypeFlag::Text(text) => match text.trim().to_lowercase().as_str() {
                    "revenue" | "receita" | "true" => Some(Nature::Revenue),
                    "expense" | "despesa" | "false" => Some(Nature::Expense),
                    _ => None,
                },
            },

            NatureRule::ChartById => {
                let id = entry.account_plan_id.as_deref()?;
                from_account_type(chart.lookup(id)?.account_type)
            }

            NatureRule::ChartByName => {
                let name = entry.account_plan_name.as_deref()?;
                from_account_type(chart.lookup_by_name(name)?)
            }

            NatureRule::PlanTypeText => [&entry.plan_type, &entry.title_type]
                .into_iter()
                .flatten()
                .find_map(|text| nature_from_type_text(text)),

            NatureRule::DebitCreditSide => {
                let credit = entry.credit_account.is_some();
                let debit = entry.debit_account.is_some();
                match (credit, debit) {
                    (true, false) => Some(Nature::Revenue),
                    (false, true) => Some(Nature::Expense),
                    _ => None,
                }
            }

            NatureRule::CodeBand(bands) => {
                let band = account_band(entry.account_plan_name.as_deref()?)?;
                bands.iter().find(|b| b.contains(band)).map(|b| b.nature)
            }

            NatureRule::Keyword(keywords) => {
                let name = entry.raw_account_label()?.to_lowercase();
                let has = |list: &[String]| list.iter().any(|k| name.contains(k.as_str()));

                if has(&keywords.revenue) && !has(&keywords.reversal) {
                    return Some(Nature::Revenue);
                }
                if has(&keywords.expense) {
                    return Some(Nature::Expense);
                }
                None
            }
        }
    }
}

fn from_account_type(account_type: ChartAccountType) -> Option<Nature> {
    match account_type {
        ChartAccountType::Receivable => Some(Nature::Revenue),
        ChartAccountType::Payable => Some(Nature::Expense),
        ChartAccountType::Other => None,
    }
}

fn nature_from_type_text(text: &str) -> Option<Nature> {
    let text = text.to_lowercase();
    if ["receivable", "revenue", "receber", "receita"].iter().any(|k| text.contains(k)) {
        Some(Nature::Revenue)
    } else if ["payable", "expense", "pagar", "despesa"].iter().any(|k| text.contains(k)) {
        Some(Nature::Expense)
    } else {
        None
    }
}

// ============================================================================
// CLASSIFIER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub nature: Nature,
    pub rule: RuleId,
}

pub struct NatureClassifier {
    rules: Vec<NatureRule>,
}

impl NatureClassifier {
    /// Full cascade with default bands and keywords
    pub fn new() -> Self {
        Self::with_keywords(KeywordSet::default())
    }

    pub fn with_keywords(keywords: KeywordSet) -> Self {
        NatureClassifier::from_rules(vec![
            NatureRule::ExplicitFlag,
            NatureRule::ChartById,
            NatureRule::ChartByName,
            NatureRule::PlanTypeText,
            NatureRule::DebitCreditSide,
            NatureRule::CodeBand(default_code_bands()),
            NatureRule::Keyword(keywords),
        ])
    }

    /// Rules are kept in cascade order regardless of the order given
    pub fn from_rules(mut rules: Vec<NatureRule>) -> Self {
        rules.sort_by_key(|r| r.id().position());
        NatureClassifier { rules }
    }

    /// Switch rules off (the terminal default cannot be disabled)
    pub fn without(mut self, disabled: &[RuleId]) -> Self {
        self.rules.retain(|r| !disabled.contains(&r.id()));
        self
    }

    pub fn rule_ids(&self) -> Vec<RuleId> {
        self.rules.iter().map(NatureRule::id).collect()
    }

    /// Always answers; every non-authoritative answer is logged with its rule
    pub fn classify<D: AccountDirectory + ?Sized>(
        &self,
        entry: &NormalizedEntry,
        chart: &D,
    ) -> Classification {
        let decided = self
            .rules
            .iter()
            .find_map(|rule| rule.decide(entry, chart).map(|nature| (nature, rule.id())));

        let reference = entry.reference_id.as_deref().unwrap_or("");
        let account = entry.raw_account_label().unwrap_or("");

        match decided {
            Some((nature, rule)) => {
                if !rule.is_authoritative() {
                    tracing::info!(
                        rule = rule.as_str(),
                        position = rule.position(),
                        nature = nature.as_str(),
                        entity = %entry.entity,
                        reference,
                        account,
                        "fallback classification used"
                    );
                }
                Classification { nature, rule }
            }
            None => {
                tracing::warn!(
                    rule = RuleId::Default.as_str(),
                    position = RuleId::Default.position(),
                    nature = Nature::Expense.as_str(),
                    entity = %entry.entity,
                    reference,
                    account,
                    "unresolved classification, defaulting to expense"
                );
                Classification {
                    nature: Nature::Expense,
                    rule: RuleId::Default,
                }
            }
        }
    }

    pub fn classify_entry<D: AccountDirectory + ?Sized>(
        &self,
        entry: NormalizedEntry,
        chart: &D,
    ) -> ClassifiedEntry {
        let Classification { nature, rule } = self.classify(&entry, chart);
        ClassifiedEntry { entry, nature, rule }
    }
}

impl Default for NatureClassifier {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::{ChartAccount, ChartOfAccounts};
    use crate::entry::RawEntry;
    use crate::normalizer::Normalizer;
    use std::io;
    use std::sync::{Arc, Mutex};

    fn create_test_entry(raw: RawEntry) -> NormalizedEntry {
        Normalizer::default().normalize(&raw).unwrap()
    }

    fn base() -> RawEntry {
        RawEntry::new("26888098000159", "2025-03-10", "100,00")
    }

    fn chart() -> ChartOfAccounts {
        ChartOfAccounts::from_accounts(vec![
            ChartAccount::new("p-rec", "Recebimentos Diversos", ChartAccountType::Receivable),
            ChartAccount::new("p-pay", "Fornecedores Gerais", ChartAccountType::Payable),
        ])
    }

    fn classify(raw: RawEntry) -> Classification {
        NatureClassifier::new().classify(&create_test_entry(raw), &chart())
    }

    #[test]
    fn test_explicit_flag_wins() {
        let c = classify(
            base()
                .with_type_flag(TypeFlag::Text("Revenue".into()))
                .with_account(Some("p-pay"), "Fornecedores Gerais"),
        );
        assert_eq!(c, Classification { nature: Nature::Revenue, rule: RuleId::ExplicitFlag });

        let c = classify(base().with_type_flag(TypeFlag::Bool(false)));
        assert_eq!(c.nature, Nature::Expense);
        assert_eq!(c.rule, RuleId::ExplicitFlag);
    }

    #[test]
    fn test_unknown_flag_text_falls_through() {
        let c = classify(
            base()
                .with_type_flag(TypeFlag::Text("Transfer".into()))
                .with_account(Some("p-rec"), "x"),
        );
        assert_eq!(c.rule, RuleId::ChartById);
        assert_eq!(c.nature, Nature::Revenue);
    }

    #[test]
    fn test_chart_lookup_by_id_then_name() {
        let c = classify(base().with_account(Some("p-pay"), "Anything"));
        assert_eq!(c, Classification { nature: Nature::Expense, rule: RuleId::ChartById });

        let c = classify(base().with_account(Some("unknown"), "  recebimentos   diversos"));
        assert_eq!(c, Classification { nature: Nature::Revenue, rule: RuleId::ChartByName });
    }

    #[test]
    fn test_plan_type_text() {
        let c = classify(base().with_plan_type("A receber"));
        assert_eq!(c, Classification { nature: Nature::Revenue, rule: RuleId::PlanTypeText });

        let mut raw = base();
        raw.title_type = Some("Payable".to_string());
        assert_eq!(classify(raw).nature, Nature::Expense);
    }

    #[test]
    fn test_credit_without_debit_is_revenue() {
        let c = classify(base().with_debit_credit("", "Sales"));
        assert_eq!(c, Classification { nature: Nature::Revenue, rule: RuleId::DebitCreditSide });

        let c = classify(base().with_debit_credit("Supplies", ""));
        assert_eq!(c, Classification { nature: Nature::Expense, rule: RuleId::DebitCreditSide });
    }

    #[test]
    fn test_code_bands() {
        let cases = [
            ("102-1 Vendas", Nature::Revenue),
            ("302-1 Outras", Nature::Revenue),
            ("205-0 ICMS", Nature::Expense),
            ("432-1 Juros", Nature::Expense),
        ];
        for (label, expected) in cases {
            let c = classify(base().with_account(None, label));
            assert_eq!(c, Classification { nature: expected, rule: RuleId::CodeBand }, "{}", label);
        }
    }

    #[test]
    fn test_keywords_and_reversal_marker() {
        let c = classify(base().with_account(None, "Billing services"));
        assert_eq!(c, Classification { nature: Nature::Revenue, rule: RuleId::Keyword });

        let c = classify(base().with_account(None, "Payroll"));
        assert_eq!(c, Classification { nature: Nature::Expense, rule: RuleId::Keyword });

        // Revenue keyword plus reversal marker: revenue is not decided here
        let c = classify(base().with_account(None, "Vendas canceladas"));
        assert_eq!(c, Classification { nature: Nature::Expense, rule: RuleId::Default });
    }

    #[test]
    fn test_default_is_expense() {
        let c = classify(base().with_account(None, "Misc"));
        assert_eq!(c, Classification { nature: Nature::Expense, rule: RuleId::Default });
    }

    #[test]
    fn test_disabled_rules_are_skipped() {
        let classifier = NatureClassifier::new().without(&[RuleId::DebitCreditSide]);
        let entry = create_test_entry(base().with_debit_credit("", "Sales"));

        let c = classifier.classify(&entry, &chart());

        assert!(!classifier.rule_ids().contains(&RuleId::DebitCreditSide));
        assert_eq!(c, Classification { nature: Nature::Revenue, rule: RuleId::Keyword });
    }

    #[test]
    fn test_rules_sorted_into_cascade_order() {
        let classifier = NatureClassifier::from_rules(vec![
            NatureRule::Keyword(KeywordSet::default()),
            NatureRule::ExplicitFlag,
        ]);
        assert_eq!(classifier.rule_ids(), vec![RuleId::ExplicitFlag, RuleId::Keyword]);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_default_branch_always_logs() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let entry = create_test_entry(base().with_account(None, "Misc").with_reference("T-77"));
        let c = tracing::subscriber::with_default(subscriber, || {
            NatureClassifier::new().classify(&entry, &chart())
        });

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert_eq!(c.rule, RuleId::Default);
        assert!(output.contains("WARN"));
        assert!(output.contains("rule=\"default\""));
        assert!(output.contains("T-77"));
    }
}
