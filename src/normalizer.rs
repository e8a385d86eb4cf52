// 🧹 Entry Normalizer - raw export fields → typed values
// Amounts become exact decimals, dates become calendar dates, entity codes
// become canonical 14-digit identifiers. Anything that cannot be resolved is
// rejected with a reason and counted by the caller.

use crate::entry::{EntityId, NormalizedEntry, RawEntry, RawValue};
use crate::error::EntryRejection;
use chrono::{Duration, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Default bound for free-text fields (downstream column limit)
pub const DEFAULT_MAX_TEXT_LEN: usize = 500;

/// Spreadsheet serial days are counted from 1899-12-30 (serial 25569 = 1970-01-01)
const SPREADSHEET_EPOCH: (i32, u32, u32) = (1899, 12, 30);

static MONTH_ONLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2})/(\d{4})$").expect("static regex"));

static YEAR_MONTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})-(\d{2})$").expect("static regex"));

// ============================================================================
// OUTCOME
// ============================================================================

/// Result of normalizing a batch: accepted entries plus every rejection
#[derive(Debug, Clone, Default)]
pub struct NormalizeOutcome {
    pub entries: Vec<NormalizedEntry>,
    /// (position in the input batch, reason)
    pub rejected: Vec<(usize, EntryRejection)>,
}

impl NormalizeOutcome {
    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }
}

// ============================================================================
// NORMALIZER
// ============================================================================

#[derive(Debug, Clone)]
pub struct Normalizer {
    max_text_len: usize,
}

impl Normalizer {
    pub fn new(max_text_len: usize) -> Self {
        Normalizer { max_text_len }
    }

    /// Normalize one entry or explain why it was refused
    pub fn normalize(&self, raw: &RawEntry) -> Result<NormalizedEntry, EntryRejection> {
        let amount = match &raw.amount {
            Some(value) => parse_amount(value)?,
            None => return Err(EntryRejection::UnparsableAmount(String::new())),
        };
        if amount.is_zero() {
            return Err(EntryRejection::ZeroAmount);
        }

        let accrual_date = match &raw.accrual_date {
            Some(value) if !is_blank(value) => parse_date(value)?,
            _ => return Err(EntryRejection::MissingAccrualDate),
        };

        let entity = EntityId::parse(&raw.entity_id)?;

        // Settlement is optional: an unreadable one only keeps the entry out of cash flow
        let settlement_date = match &raw.settlement_date {
            Some(value) if !is_blank(value) => match parse_date(value) {
                Ok(date) => Some(date),
                Err(reason) => {
                    tracing::warn!(
                        entity = %entity,
                        reference = raw.reference_id.as_deref().unwrap_or(""),
                        %reason,
                        "settlement date ignored"
                    );
                    None
                }
            },
            _ => None,
        };

        Ok(NormalizedEntry {
            entity,
            accrual_date,
            settlement_date,
            amount,
            account_plan_id: self.text(&raw.account_plan_id),
            account_plan_name: self.text(&raw.account_plan_name),
            debit_account: self.text(&raw.debit_account),
            credit_account: self.text(&raw.credit_account),
            type_flag: raw.type_flag.clone(),
            plan_type: self.text(&raw.plan_type),
            title_type: self.text(&raw.title_type),
            memo: self.text(&raw.memo),
            reference_id: self.text(&raw.reference_id),
            bank_account: self.text(&raw.bank_account),
        })
    }

    /// Normalize a batch, keeping a record of every rejected position
    pub fn normalize_all(&self, raws: &[RawEntry]) -> NormalizeOutcome {
        let mut outcome = NormalizeOutcome::default();

        for (idx, raw) in raws.iter().enumerate() {
            match self.normalize(raw) {
                Ok(entry) => outcome.entries.push(entry),
                Err(reason) => {
                    tracing::debug!(
                        position = idx,
                        reference = raw.reference_id.as_deref().unwrap_or(""),
                        reason = reason.code(),
                        "entry rejected"
                    );
                    outcome.rejected.push((idx, reason));
                }
            }
        }

        outcome
    }

    fn text(&self, value: &Option<String>) -> Option<String> {
        value
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| truncate_chars(s, self.max_text_len))
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TEXT_LEN)
    }
}

fn is_blank(value: &RawValue) -> bool {
    matches!(value, RawValue::Text(s) if s.trim().is_empty())
}

/// Truncate on a character boundary
pub fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

// ============================================================================
// AMOUNTS
// ============================================================================

/// Parse a numeric or locale-formatted amount ("R$ 1.234,56", "-45.99", "(10,00)")
pub fn parse_amount(value: &RawValue) -> Result<Decimal, EntryRejection> {
    match value {
        RawValue::Number(n) => Decimal::from_f64(*n)
            .ok_or_else(|| EntryRejection::UnparsableAmount(n.to_string())),
        RawValue::Text(text) => parse_amount_text(text),
    }
}

fn parse_amount_text(text: &str) -> Result<Decimal, EntryRejection> {
    let reject = || EntryRejection::UnparsableAmount(text.to_string());
    let trimmed = text.trim();

    let negative = trimmed.starts_with('-')
        || trimmed.ends_with('-')
        || (trimmed.starts_with('(') && trimmed.ends_with(')'));

    // Drop currency symbols, spaces and anything else that is not part of the number
    let kept: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    if !kept.chars().any(|c| c.is_ascii_digit()) {
        return Err(reject());
    }

    // "R$ 1.500" is fifteen hundred; a bare "1.500" stays a decimal
    let currency = trimmed.contains('$');

    let canonical = match (kept.rfind(','), kept.rfind('.')) {
        // Both present: whichever comes last is the decimal separator
        (Some(comma), Some(dot)) if comma > dot => kept.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => kept.replace(',', ""),
        (Some(_), None) if kept.matches(',').count() == 1 => kept.replace(',', "."),
        (Some(_), None) => kept.replace(',', ""),
        (None, Some(_)) if kept.matches('.').count() > 1 => kept.replace('.', ""),
        (None, Some(dot)) if currency && kept.len() - dot == 4 => kept.replace('.', ""),
        _ => kept,
    };

    let magnitude = Decimal::from_str(&canonical).map_err(|_| reject())?;
    Ok(if negative { -magnitude } else { magnitude })
}

// ============================================================================
// DATES
// ============================================================================

/// Parse ISO, Brazilian, month-only and spreadsheet-serial dates
pub fn parse_date(value: &RawValue) -> Result<NaiveDate, EntryRejection> {
    match value {
        RawValue::Number(serial) => from_serial(*serial)
            .ok_or_else(|| EntryRejection::UnparsableDate(serial.to_string())),
        RawValue::Text(text) => parse_date_text(text),
    }
}

fn parse_date_text(text: &str) -> Result<NaiveDate, EntryRejection> {
    let reject = || EntryRejection::UnparsableDate(text.to_string());
    let trimmed = text.trim();

    // "2025-03-10T00:00:00" → "2025-03-10"
    let day_part = trimmed.split('T').next().unwrap_or(trimmed);

    if let Ok(date) = NaiveDate::parse_from_str(day_part, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(day_part, "%d/%m/%Y") {
        return Ok(date);
    }

    if let Some(caps) = MONTH_ONLY.captures(day_part) {
        let month: u32 = caps[1].parse().map_err(|_| reject())?;
        let year: i32 = caps[2].parse().map_err(|_| reject())?;
        return NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(reject);
    }
    if let Some(caps) = YEAR_MONTH.captures(day_part) {
        let year: i32 = caps[1].parse().map_err(|_| reject())?;
        let month: u32 = caps[2].parse().map_err(|_| reject())?;
        return NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(reject);
    }

    // Serial days exported as text
    if let Ok(serial) = day_part.parse::<f64>() {
        return from_serial(serial).ok_or_else(reject);
    }

    Err(reject())
}

fn from_serial(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 || serial > 2_958_465.0 {
        return None;
    }
    let (y, m, d) = SPREADSHEET_EPOCH;
    let epoch = NaiveDate::from_ymd_opt(y, m, d)?;
    epoch.checked_add_signed(Duration::days(serial.floor() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const CNPJ: &str = "26.888.098/0001-59";

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_parse_brazilian_amount() {
        assert_eq!(parse_amount(&"R$ 1.234,56".into()), Ok(dec!(1234.56)));
        assert_eq!(parse_amount(&"1234,5".into()), Ok(dec!(1234.5)));
        assert_eq!(parse_amount(&"-45,99".into()), Ok(dec!(-45.99)));
    }

    #[test]
    fn test_parse_dotted_amounts() {
        assert_eq!(parse_amount(&"1,234.56".into()), Ok(dec!(1234.56)));
        assert_eq!(parse_amount(&"45.99".into()), Ok(dec!(45.99)));
        assert_eq!(parse_amount(&"1.234.567".into()), Ok(dec!(1234567)));
        assert_eq!(parse_amount(&"(10,00)".into()), Ok(dec!(-10.00)));
        assert_eq!(parse_amount(&RawValue::Number(150.25)), Ok(dec!(150.25)));
    }

    #[test]
    fn test_currency_amount_with_thousands_dot() {
        assert_eq!(parse_amount(&"R$ 1.500".into()), Ok(dec!(1500)));
        assert_eq!(parse_amount(&"R$ 12.345".into()), Ok(dec!(12345)));
        assert_eq!(parse_amount(&"R$ 45.99".into()), Ok(dec!(45.99)));
        // Without a currency symbol the dot stays decimal, as the ERP exports it
        assert_eq!(parse_amount(&"1.234".into()), Ok(dec!(1.234)));
    }

    #[test]
    fn test_parse_amount_rejects_text() {
        assert_eq!(
            parse_amount(&"n/a".into()),
            Err(EntryRejection::UnparsableAmount("n/a".to_string()))
        );
    }

    #[test]
    fn test_parse_dates() {
        assert_eq!(parse_date(&"2025-03-10".into()), Ok(date(2025, 3, 10)));
        assert_eq!(parse_date(&"10/03/2025".into()), Ok(date(2025, 3, 10)));
        assert_eq!(parse_date(&"03/2025".into()), Ok(date(2025, 3, 1)));
        assert_eq!(parse_date(&"2025-03-10T12:00:00".into()), Ok(date(2025, 3, 10)));
    }

    #[test]
    fn test_parse_spreadsheet_serial() {
        assert_eq!(parse_date(&RawValue::Number(25569.0)), Ok(date(1970, 1, 1)));
        assert_eq!(parse_date(&RawValue::Number(45726.0)), Ok(date(2025, 3, 10)));
        assert_eq!(parse_date(&"45726".into()), Ok(date(2025, 3, 10)));
    }

    #[test]
    fn test_parse_date_rejects_garbage() {
        assert!(matches!(
            parse_date(&"yesterday".into()),
            Err(EntryRejection::UnparsableDate(_))
        ));
    }

    #[test]
    fn test_zero_amount_rejected() {
        let raw = RawEntry::new(CNPJ, "2025-03-10", "R$ 0,00");
        assert_eq!(Normalizer::default().normalize(&raw), Err(EntryRejection::ZeroAmount));
    }

    #[test]
    fn test_missing_accrual_date_rejected() {
        let mut raw = RawEntry::new(CNPJ, "", "10,00");
        assert_eq!(
            Normalizer::default().normalize(&raw),
            Err(EntryRejection::MissingAccrualDate)
        );
        raw.accrual_date = None;
        assert_eq!(
            Normalizer::default().normalize(&raw),
            Err(EntryRejection::MissingAccrualDate)
        );
    }

    #[test]
    fn test_invalid_entity_rejected() {
        let raw = RawEntry::new("123", "2025-03-10", "10,00");
        assert!(matches!(
            Normalizer::default().normalize(&raw),
            Err(EntryRejection::InvalidEntityId(_))
        ));
    }

    #[test]
    fn test_text_fields_truncated_and_blank_dropped() {
        let long = "x".repeat(800);
        let raw = RawEntry::new(CNPJ, "2025-03-10", "10,00")
            .with_memo(&long)
            .with_bank_account("   ");

        let entry = Normalizer::default().normalize(&raw).unwrap();

        assert_eq!(entry.memo.as_ref().map(|m| m.chars().count()), Some(500));
        assert_eq!(entry.bank_account, None);
    }

    #[test]
    fn test_bad_settlement_date_is_dropped_not_fatal() {
        let raw = RawEntry::new(CNPJ, "2025-03-10", "10,00").with_settlement("soon");
        let entry = Normalizer::default().normalize(&raw).unwrap();
        assert_eq!(entry.settlement_date, None);
    }

    #[test]
    fn test_normalize_all_counts_rejections() {
        let raws = vec![
            RawEntry::new(CNPJ, "2025-03-10", "100,00"),
            RawEntry::new(CNPJ, "2025-03-10", "R$ 0,00"),
            RawEntry::new(CNPJ, "never", "5,00"),
        ];

        let outcome = Normalizer::default().normalize_all(&raws);

        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.rejected_count(), 2);
        assert_eq!(outcome.rejected[0], (1, EntryRejection::ZeroAmount));
        assert_eq!(outcome.rejected[1].0, 2);
    }
}
