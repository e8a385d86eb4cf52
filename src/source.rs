// 📥 Entry Sources - the boundary where raw entries come in
//
// The core never polls on its own. A source blocks until a unit's entries
// are available (or fails with a typed error) and the runner moves on.
//
//   Session      explicit auth context, expiry is a pure function of state
//   ReportStatus Pending → Processing → Done | Failed
//   poll         bounded attempts, fixed backoff, injectable sleeper

use crate::entry::{EntityId, RawEntry, RawValue, TypeFlag};
use crate::error::SourceError;
use crate::normalizer::parse_date;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::time::Duration;

// ============================================================================
// UNIT OF WORK
// ============================================================================

/// Inclusive date range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Period { start, end }
    }

    /// Unbounded range, used when a unit's dates are unknown up front
    pub fn all() -> Self {
        Period::new(NaiveDate::MIN, NaiveDate::MAX)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Smallest period covering every date, or None for no dates
    pub fn spanning(dates: impl IntoIterator<Item = NaiveDate>) -> Option<Self> {
        dates.into_iter().fold(None, |span: Option<Period>, d| {
            Some(match span {
                None => Period::new(d, d),
                Some(p) => Period::new(p.start.min(d), p.end.max(d)),
            })
        })
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Period::all() {
            f.write_str("all")
        } else {
            write!(f, "{}..{}", self.start, self.end)
        }
    }
}

/// One (legal entity, reporting period) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct UnitOfWork {
    pub entity: EntityId,
    pub period: Period,
}

impl UnitOfWork {
    pub fn new(entity: EntityId, period: Period) -> Self {
        UnitOfWork { entity, period }
    }
}

impl fmt::Display for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.entity, self.period)
    }
}

/// Supplies the raw entries of one unit
pub trait EntrySource {
    fn fetch(&mut self, unit: &UnitOfWork) -> Result<Vec<RawEntry>, SourceError>;

    /// Rows the source holds but could not attach to any unit
    fn unassigned(&self) -> &[RawEntry] {
        &[]
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// Auth context passed by reference into the boundary client
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub ttl: ChronoDuration,
    /// Treat the token as expired this long before it really is
    pub refresh_margin: ChronoDuration,
}

impl Session {
    pub fn new(token: &str, issued_at: DateTime<Utc>) -> Self {
        Session {
            token: token.to_string(),
            issued_at,
            ttl: ChronoDuration::hours(1),
            refresh_margin: ChronoDuration::minutes(5),
        }
    }

    pub fn with_ttl(mut self, ttl: ChronoDuration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + self.ttl - self.refresh_margin
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.token.is_empty() || now >= self.expires_at()
    }

    pub fn bearer(&self, now: DateTime<Utc>) -> Result<&str, SourceError> {
        if self.is_expired(now) {
            return Err(SourceError::SessionExpired);
        }
        Ok(&self.token)
    }
}

// ============================================================================
// REPORT STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportStatus {
    #[serde(alias = "Waiting", alias = "Aguardando")]
    Pending,
    #[serde(alias = "Processando")]
    Processing,
    #[serde(alias = "Finished", alias = "Ready", alias = "Finalizado")]
    Done,
    #[serde(alias = "Error", alias = "Erro")]
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "Pending",
            ReportStatus::Processing => "Processing",
            ReportStatus::Done => "Done",
            ReportStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportStatus::Done | ReportStatus::Failed)
    }

    pub fn can_transition_to(&self, next: ReportStatus) -> bool {
        use ReportStatus::*;
        match (self, next) {
            (Pending, _) => true,
            (Processing, Processing | Done | Failed) => true,
            _ => false,
        }
    }

    pub fn transition(self, next: ReportStatus) -> Result<ReportStatus, SourceError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SourceError::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }
}

// ============================================================================
// POLLING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            max_attempts: 30,
            interval_ms: 5000,
        }
    }
}

impl PollPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Drive `probe` until Done, sleeping a fixed interval between attempts.
/// Returns the attempt that saw Done.
pub fn poll_until_ready<P, S>(
    policy: &PollPolicy,
    mut probe: P,
    mut sleeper: S,
) -> Result<u32, SourceError>
where
    P: FnMut(u32) -> Result<ReportStatus, SourceError>,
    S: FnMut(Duration),
{
    let mut state = ReportStatus::Pending;

    for attempt in 1..=policy.max_attempts {
        state = state.transition(probe(attempt)?)?;
        tracing::debug!(attempt, status = state.as_str(), "report status");

        match state {
            ReportStatus::Done => return Ok(attempt),
            ReportStatus::Failed => {
                return Err(SourceError::ReportFailed(format!(
                    "report failed on attempt {}",
                    attempt
                )))
            }
            _ if attempt < policy.max_attempts => sleeper(policy.interval()),
            _ => {}
        }
    }

    Err(SourceError::UpstreamTimeout {
        attempts: policy.max_attempts,
    })
}

// ============================================================================
// POLLED SOURCE
// ============================================================================

/// Remote report API: request, check status, download
pub trait ReportClient {
    fn request_report(&mut self, session: &Session, unit: &UnitOfWork)
        -> Result<String, SourceError>;

    fn report_status(&mut self, session: &Session, report_id: &str)
        -> Result<ReportStatus, SourceError>;

    fn download(&mut self, session: &Session, report_id: &str)
        -> Result<Vec<RawEntry>, SourceError>;
}

pub struct PolledSource<C, S> {
    client: C,
    session: Session,
    policy: PollPolicy,
    sleeper: S,
}

impl<C: ReportClient, S: FnMut(Duration)> PolledSource<C, S> {
    pub fn new(client: C, session: Session, policy: PollPolicy, sleeper: S) -> Self {
        PolledSource {
            client,
            session,
            policy,
            sleeper,
        }
    }

    /// Swap in a refreshed session
    pub fn renew(&mut self, session: Session) {
        self.session = session;
    }
}

impl<C: ReportClient, S: FnMut(Duration)> EntrySource for PolledSource<C, S> {
    fn fetch(&mut self, unit: &UnitOfWork) -> Result<Vec<RawEntry>, SourceError> {
        self.session.bearer(Utc::now())?;

        let report_id = self.client.request_report(&self.session, unit)?;
        let client = &mut self.client;
        let session = &self.session;
        let attempts = poll_until_ready(
            &self.policy,
            |_| client.report_status(session, &report_id),
            &mut self.sleeper,
        )?;

        tracing::info!(unit = %unit, report_id = %report_id, attempts, "report ready");
        self.client.download(&self.session, &report_id)
    }
}

// ============================================================================
// CSV FILE SOURCE
// ============================================================================

/// One row of a raw-entry CSV export; every column optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct CsvRow {
    entity_id: String,
    accrual_date: Option<String>,
    settlement_date: Option<String>,
    amount: Option<String>,
    account_plan_id: Option<String>,
    account_plan_name: Option<String>,
    debit_account: Option<String>,
    credit_account: Option<String>,
    #[serde(rename = "type")]
    type_flag: Option<String>,
    plan_type: Option<String>,
    title_type: Option<String>,
    #[serde(alias = "description")]
    memo: Option<String>,
    reference_id: Option<String>,
    bank_account: Option<String>,
}

impl From<CsvRow> for RawEntry {
    fn from(row: CsvRow) -> Self {
        RawEntry {
            accrual_date: row.accrual_date.map(RawValue::Text),
            settlement_date: row.settlement_date.map(RawValue::Text),
            amount: row.amount.map(RawValue::Text),
            account_plan_id: row.account_plan_id,
            account_plan_name: row.account_plan_name,
            debit_account: row.debit_account,
            credit_account: row.credit_account,
            type_flag: row.type_flag.map(TypeFlag::Text),
            plan_type: row.plan_type,
            title_type: row.title_type,
            entity_id: row.entity_id,
            memo: row.memo,
            reference_id: row.reference_id,
            bank_account: row.bank_account,
        }
    }
}

/// File-backed source: the whole export is read up front and served per entity
pub struct CsvEntrySource {
    by_entity: BTreeMap<EntityId, Vec<RawEntry>>,
    unassigned: Vec<RawEntry>,
}

impl CsvEntrySource {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = csv::Reader::from_path(path.as_ref())
            .with_context(|| format!("Failed to open CSV file: {:?}", path.as_ref()))?;
        Self::from_csv(reader)
    }

    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self> {
        Self::from_csv(csv::Reader::from_reader(reader))
    }

    fn from_csv<R: io::Read>(mut reader: csv::Reader<R>) -> Result<Self> {
        let mut by_entity: BTreeMap<EntityId, Vec<RawEntry>> = BTreeMap::new();
        let mut unassigned = Vec::new();

        for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
            let row = result
                .with_context(|| format!("Failed to deserialize entry at row {}", line + 1))?;
            let entry = RawEntry::from(row);
            match EntityId::parse(&entry.entity_id) {
                Ok(entity) => by_entity.entry(entity).or_default().push(entry),
                Err(_) => unassigned.push(entry),
            }
        }

        if !unassigned.is_empty() {
            tracing::warn!(rows = unassigned.len(), "rows without a valid entity id");
        }

        Ok(CsvEntrySource { by_entity, unassigned })
    }

    /// One unit per entity, spanning its parseable accrual dates
    pub fn units(&self) -> Vec<UnitOfWork> {
        self.by_entity
            .iter()
            .map(|(entity, entries)| {
                let dates = entries
                    .iter()
                    .filter_map(|e| e.accrual_date.as_ref())
                    .filter_map(|d| parse_date(d).ok());
                UnitOfWork::new(entity.clone(), Period::spanning(dates).unwrap_or_else(Period::all))
            })
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.by_entity.values().map(Vec::len).sum::<usize>() + self.unassigned.len()
    }
}

impl EntrySource for CsvEntrySource {
    fn fetch(&mut self, unit: &UnitOfWork) -> Result<Vec<RawEntry>, SourceError> {
        Ok(self.by_entity.get(&unit.entity).cloned().unwrap_or_default())
    }

    /// Rows whose entity id is not a valid 14-digit code
    fn unassigned(&self) -> &[RawEntry] {
        &self.unassigned
    }
}

// ============================================================================
// TESTS
// ============================================================================
