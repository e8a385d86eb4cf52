// 🗄️ SQLite persistence - statement rows keyed by natural-key fingerprint
//
// Every row carries a UNIQUE SHA-256 fingerprint of its natural key.
// Upserts replace the stored amount (never add to it) and pruning removes
// in-scope rows the recompute no longer emits, so re-running a unit
// converges on the freshly recomputed aggregate.

use crate::error::PersistenceError;
use crate::reconciliation::{NaturalKey, PlanScope, UpsertBatch, UpsertSink};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;

// ============================================================================
// STORED ROWS
// ============================================================================

/// One persisted statement row as read back from the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRow {
    pub natural_key: String,
    pub entity: String,
    pub date: String,
    /// Account label (DRE) or category (DFC)
    pub label: String,
    /// Nature (DRE) or direction (DFC)
    pub side: String,
    pub bank_account: Option<String>,
    pub amount: Decimal,
}

/// Event for the import audit trail
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub event_type: String,
    pub data: serde_json::Value,
}

impl RunEvent {
    pub fn new(run_id: &str, event_type: &str, data: serde_json::Value) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            event_type: event_type.to_string(),
            data,
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS dre_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            natural_key TEXT UNIQUE NOT NULL,
            entity TEXT NOT NULL,
            date TEXT NOT NULL,
            account TEXT NOT NULL,
            nature TEXT NOT NULL,
            amount TEXT NOT NULL,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS dfc_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            natural_key TEXT UNIQUE NOT NULL,
            entity TEXT NOT NULL,
            date TEXT NOT NULL,
            direction TEXT NOT NULL,
            category TEXT NOT NULL,
            bank_account TEXT NOT NULL,
            amount TEXT NOT NULL,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            run_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            data TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_dre_entity_date ON dre_entries(entity, date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_dfc_entity_date ON dfc_entries(entity, date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_run ON import_events(run_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// STORE
// ============================================================================

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open database: {:?}", path.as_ref()))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        setup_database(&conn).context("Failed to set up database schema")?;
        Ok(SqliteStore { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn load_dre_rows(&self) -> Result<Vec<StoredRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT natural_key, entity, date, account, nature, amount
             FROM dre_entries ORDER BY entity, date, account, nature",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut stored = Vec::new();
        for row in rows {
            let (natural_key, entity, date, label, side, amount) = row?;
            stored.push(StoredRow {
                natural_key,
                entity,
                date,
                label,
                side,
                bank_account: None,
                amount: parse_stored_amount(&amount)?,
            });
        }
        Ok(stored)
    }

    pub fn load_dfc_rows(&self) -> Result<Vec<StoredRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT natural_key, entity, date, category, direction, bank_account, amount
             FROM dfc_entries ORDER BY entity, date, category, direction, bank_account",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut stored = Vec::new();
        for row in rows {
            let (natural_key, entity, date, label, side, bank_account, amount) = row?;
            stored.push(StoredRow {
                natural_key,
                entity,
                date,
                label,
                side,
                bank_account: Some(bank_account),
                amount: parse_stored_amount(&amount)?,
            });
        }
        Ok(stored)
    }

    /// Stored amount for one natural key, if present
    pub fn amount_for(&self, key: &NaturalKey) -> Result<Option<Decimal>> {
        let table = match key {
            NaturalKey::Dre { .. } => "dre_entries",
            NaturalKey::Dfc { .. } => "dfc_entries",
        };
        let amount: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT amount FROM {} WHERE natural_key = ?1", table),
                params![key.fingerprint()],
                |row| row.get(0),
            )
            .optional()?;

        amount.map(|a| parse_stored_amount(&a)).transpose()
    }

    /// Insert event into the import audit trail
    pub fn record_event(&self, event: &RunEvent) -> Result<()> {
        let data_json = serde_json::to_string(&event.data)?;

        self.conn.execute(
            "INSERT INTO import_events (event_id, timestamp, run_id, event_type, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.event_id,
                event.timestamp.to_rfc3339(),
                event.run_id,
                event.event_type,
                data_json,
            ],
        )?;

        Ok(())
    }

    pub fn events_for_run(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, timestamp, run_id, event_type, data
             FROM import_events WHERE run_id = ?1 ORDER BY id",
        )?;

        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (event_id, timestamp, run_id, event_type, data) = row?;
            events.push(RunEvent {
                event_id,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .context("Invalid event timestamp")?
                    .with_timezone(&Utc),
                run_id,
                event_type,
                data: serde_json::from_str(&data).context("Invalid event data")?,
            });
        }
        Ok(events)
    }
}

fn parse_stored_amount(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).with_context(|| format!("Invalid stored amount: {:?}", raw))
}

impl UpsertSink for SqliteStore {
    /// One transaction per batch: all rows land or none do
    fn upsert_batch(&mut self, batch: &UpsertBatch) -> Result<usize, PersistenceError> {
        let tx = self.conn.transaction()?;

        for row in &batch.rows {
            let fingerprint = row.key.fingerprint();
            let amount = row.amount.to_string();

            match &row.key {
                NaturalKey::Dre { entity, date, account, nature } => {
                    tx.execute(
                        "INSERT INTO dre_entries (natural_key, entity, date, account, nature, amount)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT(natural_key) DO UPDATE SET
                            amount = excluded.amount,
                            updated_at = CURRENT_TIMESTAMP",
                        params![
                            fingerprint,
                            entity.as_str(),
                            date.to_string(),
                            account,
                            nature.as_str(),
                            amount
                        ],
                    )?;
                }
                NaturalKey::Dfc { entity, date, direction, category, bank_account } => {
                    tx.execute(
                        "INSERT INTO dfc_entries (natural_key, entity, date, direction, category, bank_account, amount)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                         ON CONFLICT(natural_key) DO UPDATE SET
                            amount = excluded.amount,
                            updated_at = CURRENT_TIMESTAMP",
                        params![
                            fingerprint,
                            entity.as_str(),
                            date.to_string(),
                            direction.as_str(),
                            category,
                            bank_account,
                            amount
                        ],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(batch.len())
    }

    /// Both statement tables in one transaction
    fn prune(
        &mut self,
        scope: &PlanScope,
        keep: &BTreeSet<String>,
    ) -> Result<usize, PersistenceError> {
        let tx = self.conn.transaction()?;
        let mut removed = 0;

        for table in ["dre_entries", "dfc_entries"] {
            let stale = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT natural_key FROM {}
                     WHERE entity = ?1
                       AND (?2 IS NULL OR date >= ?2)
                       AND (?3 IS NULL OR date <= ?3)",
                    table
                ))?;
                let keys = stmt.query_map(
                    params![
                        scope.entity.as_str(),
                        scope.from.map(|d| d.to_string()),
                        scope.to.map(|d| d.to_string())
                    ],
                    |row| row.get::<_, String>(0),
                )?;
                let stale = keys
                    .filter(|key| !matches!(key, Ok(k) if keep.contains(k)))
                    .collect::<Result<Vec<String>, _>>()?;
                stale
            };

            for key in &stale {
                removed += tx.execute(
                    &format!("DELETE FROM {} WHERE natural_key = ?1", table),
                    params![key],
                )?;
            }
        }

        tx.commit()?;
        Ok(removed)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Direction, EntityId, Nature};
    use crate::reconciliation::{apply_plan, UpsertPlan, UpsertRow};
    use crate::source::{Period, UnitOfWork};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn dre_key(account: &str) -> NaturalKey {
        NaturalKey::Dre {
            entity: EntityId::parse("26888098000159").unwrap(),
            date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            account: account.to_string(),
            nature: Nature::Revenue,
        }
    }

    fn dfc_key(bank: &str) -> NaturalKey {
        NaturalKey::Dfc {
            entity: EntityId::parse("26888098000159").unwrap(),
            date: NaiveDate::from_ymd_opt(2025, 4, 1).unwrap(),
            direction: Direction::Inflow,
            category: "Gross Revenue".to_string(),
            bank_account: bank.to_string(),
        }
    }

    fn create_test_batch(rows: Vec<(NaturalKey, Decimal)>) -> UpsertBatch {
        UpsertBatch {
            rows: rows.into_iter().map(|(key, amount)| UpsertRow { key, amount }).collect(),
        }
    }

    #[test]
    fn test_upsert_twice_is_idempotent() {
        let mut store = SqliteStore::in_memory().unwrap();
        let batch = create_test_batch(vec![
            (dre_key("Vendas"), dec!(150.00)),
            (dfc_key(""), dec!(150.00)),
            (dfc_key("Itaú 123"), dec!(20)),
        ]);

        store.upsert_batch(&batch).unwrap();
        let first = (store.load_dre_rows().unwrap(), store.load_dfc_rows().unwrap());

        store.upsert_batch(&batch).unwrap();
        let second = (store.load_dre_rows().unwrap(), store.load_dfc_rows().unwrap());

        assert_eq!(first, second);
        assert_eq!(second.0.len(), 1);
        assert_eq!(second.1.len(), 2);
        assert_eq!(second.0[0].amount, dec!(150));

        println!("✅ Idempotent upsert test PASSED");
    }

    #[test]
    fn test_upsert_replaces_instead_of_adding() {
        let mut store = SqliteStore::in_memory().unwrap();

        store.upsert_batch(&create_test_batch(vec![(dre_key("Vendas"), dec!(150))])).unwrap();
        // Recomputed aggregate after a late-arriving entry of 25
        store.upsert_batch(&create_test_batch(vec![(dre_key("Vendas"), dec!(175))])).unwrap();

        assert_eq!(store.amount_for(&dre_key("Vendas")).unwrap(), Some(dec!(175)));
        assert_eq!(store.load_dre_rows().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_bank_account_is_its_own_key() {
        let mut store = SqliteStore::in_memory().unwrap();
        store
            .upsert_batch(&create_test_batch(vec![
                (dfc_key(""), dec!(1)),
                (dfc_key("Caixa"), dec!(2)),
            ]))
            .unwrap();

        let rows = store.load_dfc_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].bank_account.as_deref(), Some(""));
        assert_eq!(rows[0].side, "inflow");
        assert_eq!(store.amount_for(&dfc_key("missing")).unwrap(), None);
    }

    #[test]
    fn test_apply_plan_through_store() {
        let mut store = SqliteStore::in_memory().unwrap();
        let plan = UpsertPlan {
            batches: vec![
                create_test_batch(vec![(dre_key("A"), dec!(1))]),
                create_test_batch(vec![(dre_key("B"), dec!(2))]),
            ],
            scope: None,
        };

        let report = apply_plan(&plan, &mut store);

        assert_eq!(report.batches_written, 2);
        assert_eq!(report.rows_written, 2);
        assert_eq!(store.load_dre_rows().unwrap().len(), 2);
    }

    fn unit_plan(rows: Vec<(NaturalKey, Decimal)>, period: Period) -> UpsertPlan {
        let unit = UnitOfWork::new(EntityId::parse("26888098000159").unwrap(), period);
        UpsertPlan {
            batches: vec![create_test_batch(rows)],
            scope: Some(PlanScope::for_unit(&unit)),
        }
    }

    #[test]
    fn test_rerun_prunes_rows_no_longer_emitted() {
        let mut store = SqliteStore::in_memory().unwrap();
        apply_plan(
            &unit_plan(
                vec![(dre_key("Vendas"), dec!(100)), (dfc_key(""), dec!(100))],
                Period::all(),
            ),
            &mut store,
        );

        // The recompute netted the sales bucket to zero, so it emits nothing
        let report = apply_plan(&unit_plan(Vec::new(), Period::all()), &mut store);

        assert_eq!(report.rows_pruned, 2);
        assert!(!report.prune_failed);
        assert!(store.load_dre_rows().unwrap().is_empty());
        assert!(store.load_dfc_rows().unwrap().is_empty());

        println!("✅ Stale row pruning test PASSED");
    }

    #[test]
    fn test_prune_keeps_planned_and_out_of_scope_rows() {
        let mut store = SqliteStore::in_memory().unwrap();
        let other_entity = NaturalKey::Dre {
            entity: EntityId::parse("11222333000181").unwrap(),
            date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            account: "Vendas".to_string(),
            nature: Nature::Revenue,
        };
        store
            .upsert_batch(&create_test_batch(vec![
                (dre_key("Vendas"), dec!(100)),
                (dre_key("Serviços"), dec!(40)),
                (dfc_key(""), dec!(100)),
                (other_entity.clone(), dec!(7)),
            ]))
            .unwrap();

        // March only: the April cash-flow row and the other entity are untouched
        let march = Period::new(
            NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 31).unwrap(),
        );
        let plan = unit_plan(vec![(dre_key("Vendas"), dec!(120))], march);
        let report = apply_plan(&plan, &mut store);

        assert_eq!(report.rows_pruned, 1);
        assert_eq!(store.amount_for(&dre_key("Vendas")).unwrap(), Some(dec!(120)));
        assert_eq!(store.amount_for(&dre_key("Serviços")).unwrap(), None);
        assert_eq!(store.amount_for(&dfc_key("")).unwrap(), Some(dec!(100)));
        assert_eq!(store.amount_for(&other_entity).unwrap(), Some(dec!(7)));
    }

    #[test]
    fn test_event_log() {
        let store = SqliteStore::in_memory().unwrap();
        let event = RunEvent::new("run-1", "unit_completed", serde_json::json!({"dre_rows": 3}));

        store.record_event(&event).unwrap();

        let events = store.events_for_run("run-1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "unit_completed");
        assert_eq!(events[0].data["dre_rows"], 3);
        assert!(store.events_for_run("run-2").unwrap().is_empty());
    }
}
