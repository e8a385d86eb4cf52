// 📒 Chart of Accounts - read-only directory of account plans
//
// Built once per run before classification starts, then only read.
// Lookups by plan identifier, or by normalized account name.

use crate::entry::normalize_label;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

// ============================================================================
// ACCOUNT TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChartAccountType {
    /// "A receber" - money coming in
    Receivable,

    /// "A pagar" - money going out
    Payable,

    /// Anything the directory cannot vouch for
    Other,
}

impl ChartAccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartAccountType::Receivable => "Receivable",
            ChartAccountType::Payable => "Payable",
            ChartAccountType::Other => "Other",
        }
    }

    /// Accepts the ERP's Portuguese labels as well as English ones
    pub fn from_label(label: &str) -> Self {
        let label = label.trim().to_lowercase();
        if label.contains("receber") || label.contains("receivable") {
            ChartAccountType::Receivable
        } else if label.contains("pagar") || label.contains("payable") {
            ChartAccountType::Payable
        } else {
            ChartAccountType::Other
        }
    }
}

impl From<String> for ChartAccountType {
    fn from(label: String) -> Self {
        ChartAccountType::from_label(&label)
    }
}

impl From<ChartAccountType> for String {
    fn from(kind: ChartAccountType) -> Self {
        kind.as_str().to_string()
    }
}

// ============================================================================
// ACCOUNT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartAccount {
    pub id: String,
    /// Display name, usually prefixed by its code ("102-1 Vendas de Mercadorias")
    pub name: String,
    #[serde(rename = "type")]
    pub account_type: ChartAccountType,
}

impl ChartAccount {
    pub fn new(id: &str, name: &str, account_type: ChartAccountType) -> Self {
        ChartAccount {
            id: id.to_string(),
            name: name.to_string(),
            account_type,
        }
    }
}

// ============================================================================
// DIRECTORY
// ============================================================================

/// Read-only account lookups consumed by the classifier and aggregator
pub trait AccountDirectory {
    fn lookup(&self, account_id: &str) -> Option<&ChartAccount>;

    fn lookup_by_name(&self, name: &str) -> Option<ChartAccountType>;
}

#[derive(Debug, Clone, Default)]
pub struct ChartOfAccounts {
    by_id: HashMap<String, ChartAccount>,
    by_name: HashMap<String, ChartAccountType>,
}

impl ChartOfAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the directory from a list of accounts; the first name wins on clashes
    pub fn from_accounts(accounts: impl IntoIterator<Item = ChartAccount>) -> Self {
        let mut chart = ChartOfAccounts::new();
        for account in accounts {
            let name_key = normalize_label(&account.name);
            if !name_key.is_empty() {
                chart.by_name.entry(name_key).or_insert(account.account_type);
            }
            chart.by_id.entry(account.id.clone()).or_insert(account);
        }
        chart
    }

    /// Load accounts from a JSON array of `{ "id", "name", "type" }`
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read chart of accounts: {:?}", path.as_ref()))?;

        let accounts: Vec<ChartAccount> = serde_json::from_str(&content)
            .context("Failed to parse chart of accounts JSON")?;

        Ok(ChartOfAccounts::from_accounts(accounts))
    }

    pub fn count(&self) -> usize {
        self.by_id.len()
    }

    pub fn count_by_type(&self, account_type: ChartAccountType) -> usize {
        self.by_id
            .values()
            .filter(|a| a.account_type == account_type)
            .count()
    }
}

impl AccountDirectory for ChartOfAccounts {
    fn lookup(&self, account_id: &str) -> Option<&ChartAccount> {
        self.by_id.get(account_id.trim())
    }

    fn lookup_by_name(&self, name: &str) -> Option<ChartAccountType> {
        self.by_name.get(&normalize_label(name)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chart() -> ChartOfAccounts {
        ChartOfAccounts::from_accounts(vec![
            ChartAccount::new("acc-1", "102-1 Vendas de Mercadorias", ChartAccountType::Receivable),
            ChartAccount::new("acc-2", "420-1 Aluguel", ChartAccountType::Payable),
            ChartAccount::new("acc-3", "102-1  VENDAS de mercadorias", ChartAccountType::Payable),
        ])
    }

    #[test]
    fn test_lookup_by_id() {
        let chart = sample_chart();
        let account = chart.lookup("acc-2").unwrap();
        assert_eq!(account.name, "420-1 Aluguel");
        assert_eq!(account.account_type, ChartAccountType::Payable);
        assert!(chart.lookup("missing").is_none());
    }

    #[test]
    fn test_lookup_by_name_is_normalized_and_first_wins() {
        let chart = sample_chart();
        assert_eq!(
            chart.lookup_by_name("  102-1 vendas DE Mercadorias "),
            Some(ChartAccountType::Receivable)
        );
    }

    #[test]
    fn test_account_type_labels() {
        assert_eq!(ChartAccountType::from_label("A receber"), ChartAccountType::Receivable);
        assert_eq!(ChartAccountType::from_label("A Pagar"), ChartAccountType::Payable);
        assert_eq!(ChartAccountType::from_label("payable"), ChartAccountType::Payable);
        assert_eq!(ChartAccountType::from_label("Transferência"), ChartAccountType::Other);
    }

    #[test]
    fn test_deserialize_from_json() {
        let json = r#"[{"id": "p1", "name": "205-0 ICMS", "type": "A pagar"}]"#;
        let accounts: Vec<ChartAccount> = serde_json::from_str(json).unwrap();
        let chart = ChartOfAccounts::from_accounts(accounts);

        assert_eq!(chart.count(), 1);
        assert_eq!(chart.count_by_type(ChartAccountType::Payable), 1);
    }
}
