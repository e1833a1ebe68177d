use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{OptionalExtension, TransactionBehavior};
use rust_decimal::Decimal;
use time::OffsetDateTime;

use super::ledger::{self, LedgerTx};
use super::{
    ConsumeOutcome, ConsumeRequest, CreditBalanceRecord, CreditDelta, CreditEntryType,
    CreditLedgerRecord, CreditOutcome, MeteringStore, StoreError, UsageEventRecord,
    UsageTrackerRecord, unix_millis,
};
use crate::scope::{Scope, ScopeKey, ScopeKind};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable store on a SQLite file.
///
/// Writers take the database write lock at `BEGIN IMMEDIATE`, so the
/// read-decide-write sequence of a consume is serialized across connections
/// and processes. Reads run outside any write transaction and, with WAL
/// enabled, never wait on writers.
///
/// SQLite has one writer per database, so consumes for different scope keys
/// also queue behind each other; each wait is bounded by the busy timeout.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path, busy_timeout)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    async fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let conn = open_connection(path, busy_timeout)?;
            init_schema(&conn)?;
            f(&conn)
        })
        .await?
    }

    async fn write<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteLedger<'_>) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path, busy_timeout)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let conn: &rusqlite::Connection = &tx;
            let out = f(&mut SqliteLedger { conn })?;
            tx.commit()?;
            Ok(out)
        })
        .await?
    }
}

#[async_trait]
impl MeteringStore for SqliteStore {
    async fn usage_tracker(
        &self,
        key: &ScopeKey,
        period_start: OffsetDateTime,
    ) -> Result<Option<UsageTrackerRecord>, StoreError> {
        let key = key.clone();
        let period_start_ms = unix_millis(period_start);
        self.read(move |conn| select_usage_tracker(conn, &key, period_start_ms))
            .await
    }

    async fn usage_event(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<UsageEventRecord>, StoreError> {
        let idempotency_key = idempotency_key.to_string();
        self.read(move |conn| select_usage_event(conn, &idempotency_key))
            .await
    }

    async fn credit_wallet(
        &self,
        key: &ScopeKey,
    ) -> Result<Option<CreditBalanceRecord>, StoreError> {
        let key = key.clone();
        self.read(move |conn| select_credit_wallet(conn, &key)).await
    }

    async fn consume_usage(&self, request: ConsumeRequest) -> Result<ConsumeOutcome, StoreError> {
        self.write(move |tx| ledger::consume_usage(tx, &request))
            .await
    }

    async fn apply_credit_delta(&self, delta: CreditDelta) -> Result<CreditOutcome, StoreError> {
        self.write(move |tx| ledger::apply_credit_delta(tx, &delta))
            .await
    }

    async fn list_usage_events(
        &self,
        key: &ScopeKey,
    ) -> Result<Vec<UsageEventRecord>, StoreError> {
        let key = key.clone();
        self.read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USAGE_EVENT_COLUMNS}
                 FROM usage_events
                 WHERE scope_kind=?1 AND agency_id=?2 AND sub_account_id=?3 AND feature_key=?4
                 ORDER BY occurred_at_ms, rowid"
            ))?;
            let (kind, agency, sub_account, feature) = scope_params(&key);
            let rows = stmt.query_map(
                rusqlite::params![kind, agency, sub_account, feature],
                usage_event_from_row,
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn list_credit_ledger(
        &self,
        key: &ScopeKey,
    ) -> Result<Vec<CreditLedgerRecord>, StoreError> {
        let key = key.clone();
        self.read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CREDIT_ENTRY_COLUMNS}
                 FROM credit_ledger
                 WHERE scope_kind=?1 AND agency_id=?2 AND sub_account_id=?3 AND feature_key=?4
                 ORDER BY id"
            ))?;
            let (kind, agency, sub_account, feature) = scope_params(&key);
            let rows = stmt.query_map(
                rusqlite::params![kind, agency, sub_account, feature],
                credit_entry_from_row,
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }
}

/// Row access bound to an open `BEGIN IMMEDIATE` transaction.
struct SqliteLedger<'c> {
    conn: &'c rusqlite::Connection,
}

impl LedgerTx for SqliteLedger<'_> {
    fn usage_event(
        &mut self,
        idempotency_key: &str,
    ) -> Result<Option<UsageEventRecord>, StoreError> {
        select_usage_event(self.conn, idempotency_key)
    }

    fn usage_tracker(
        &mut self,
        key: &ScopeKey,
        period_start_ms: i64,
    ) -> Result<Option<UsageTrackerRecord>, StoreError> {
        select_usage_tracker(self.conn, key, period_start_ms)
    }

    fn ensure_usage_tracker(
        &mut self,
        key: &ScopeKey,
        period_start_ms: i64,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let (kind, agency, sub_account, feature) = scope_params(key);
        self.conn.execute(
            "INSERT OR IGNORE INTO usage_trackers
                (scope_kind, agency_id, sub_account_id, feature_key,
                 period_start_ms, current_usage, last_event_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, '0', ?6)",
            rusqlite::params![kind, agency, sub_account, feature, period_start_ms, now_ms],
        )?;
        Ok(())
    }

    fn set_usage(
        &mut self,
        key: &ScopeKey,
        period_start_ms: i64,
        usage: Decimal,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let (kind, agency, sub_account, feature) = scope_params(key);
        let updated = self.conn.execute(
            "UPDATE usage_trackers
             SET current_usage = ?6,
                 last_event_at_ms = ?7
             WHERE scope_kind=?1 AND agency_id=?2 AND sub_account_id=?3 AND feature_key=?4
               AND period_start_ms=?5",
            rusqlite::params![
                kind,
                agency,
                sub_account,
                feature,
                period_start_ms,
                decimal_text(usage),
                now_ms
            ],
        )?;
        if updated != 1 {
            return Err(StoreError::Corrupt(format!("missing usage tracker for {key}")));
        }
        Ok(())
    }

    fn insert_usage_event(&mut self, event: &UsageEventRecord) -> Result<(), StoreError> {
        let (kind, agency, sub_account, feature) = scope_params(&event.key);
        self.conn.execute(
            "INSERT OR IGNORE INTO usage_events
                (idempotency_key, scope_kind, agency_id, sub_account_id, feature_key, quantity,
                 action_key, period_start_ms, usage_before, usage_after, max_allowed,
                 credits_consumed, occurred_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                event.idempotency_key,
                kind,
                agency,
                sub_account,
                feature,
                decimal_text(event.quantity),
                event.action_key,
                event.period_start_ms,
                decimal_text(event.usage_before),
                decimal_text(event.usage_after),
                event.max_allowed.map(decimal_text),
                decimal_text(event.credits_consumed),
                event.occurred_at_ms
            ],
        )?;
        Ok(())
    }

    fn credit_wallet(&mut self, key: &ScopeKey) -> Result<Option<CreditBalanceRecord>, StoreError> {
        select_credit_wallet(self.conn, key)
    }

    fn ensure_credit_wallet(&mut self, key: &ScopeKey, now_ms: i64) -> Result<(), StoreError> {
        let (kind, agency, sub_account, feature) = scope_params(key);
        self.conn.execute(
            "INSERT OR IGNORE INTO credit_balances
                (scope_kind, agency_id, sub_account_id, feature_key,
                 balance, expires_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, '0', NULL, ?5)",
            rusqlite::params![kind, agency, sub_account, feature, now_ms],
        )?;
        Ok(())
    }

    fn set_credit_wallet(
        &mut self,
        key: &ScopeKey,
        balance: Decimal,
        expires_at_ms: Option<i64>,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let (kind, agency, sub_account, feature) = scope_params(key);
        let updated = self.conn.execute(
            "UPDATE credit_balances
             SET balance = ?5,
                 expires_at_ms = ?6,
                 updated_at_ms = ?7
             WHERE scope_kind=?1 AND agency_id=?2 AND sub_account_id=?3 AND feature_key=?4",
            rusqlite::params![
                kind,
                agency,
                sub_account,
                feature,
                decimal_text(balance),
                expires_at_ms,
                now_ms
            ],
        )?;
        if updated != 1 {
            return Err(StoreError::Corrupt(format!("missing credit wallet for {key}")));
        }
        Ok(())
    }

    fn credit_entry(
        &mut self,
        idempotency_key: &str,
    ) -> Result<Option<CreditLedgerRecord>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {CREDIT_ENTRY_COLUMNS} FROM credit_ledger WHERE idempotency_key=?1"
                ),
                rusqlite::params![idempotency_key],
                credit_entry_from_row,
            )
            .optional()?)
    }

    fn insert_credit_entry(
        &mut self,
        entry: &CreditLedgerRecord,
    ) -> Result<CreditLedgerRecord, StoreError> {
        let (kind, agency, sub_account, feature) = scope_params(&entry.key);
        // No OR IGNORE: a duplicate key here means the caller skipped its
        // idempotency check, and the unique constraint must abort the transaction.
        self.conn.execute(
            "INSERT INTO credit_ledger
                (idempotency_key, scope_kind, agency_id, sub_account_id, feature_key, entry_type,
                 delta, reason, period_start_ms, period_end_ms, occurred_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                entry.idempotency_key,
                kind,
                agency,
                sub_account,
                feature,
                entry.entry_type.as_str(),
                decimal_text(entry.delta),
                entry.reason,
                entry.period_start_ms,
                entry.period_end_ms,
                entry.occurred_at_ms
            ],
        )?;
        let mut stored = entry.clone();
        stored.id = self.conn.last_insert_rowid();
        Ok(stored)
    }
}

const USAGE_EVENT_COLUMNS: &str = "idempotency_key, scope_kind, agency_id, sub_account_id, \
    feature_key, quantity, action_key, period_start_ms, usage_before, usage_after, max_allowed, \
    credits_consumed, occurred_at_ms";

const CREDIT_ENTRY_COLUMNS: &str = "id, idempotency_key, scope_kind, agency_id, sub_account_id, \
    feature_key, entry_type, delta, reason, period_start_ms, period_end_ms, occurred_at_ms";

fn select_usage_tracker(
    conn: &rusqlite::Connection,
    key: &ScopeKey,
    period_start_ms: i64,
) -> Result<Option<UsageTrackerRecord>, StoreError> {
    let (kind, agency, sub_account, feature) = scope_params(key);
    Ok(conn
        .query_row(
            "SELECT current_usage, last_event_at_ms
             FROM usage_trackers
             WHERE scope_kind=?1 AND agency_id=?2 AND sub_account_id=?3 AND feature_key=?4
               AND period_start_ms=?5",
            rusqlite::params![kind, agency, sub_account, feature, period_start_ms],
            |row| {
                Ok(UsageTrackerRecord {
                    key: key.clone(),
                    period_start_ms,
                    current_usage: row.get::<_, DecimalText>(0)?.0,
                    last_event_at_ms: row.get(1)?,
                })
            },
        )
        .optional()?)
}

fn select_usage_event(
    conn: &rusqlite::Connection,
    idempotency_key: &str,
) -> Result<Option<UsageEventRecord>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {USAGE_EVENT_COLUMNS} FROM usage_events WHERE idempotency_key=?1"),
            rusqlite::params![idempotency_key],
            usage_event_from_row,
        )
        .optional()?)
}

fn select_credit_wallet(
    conn: &rusqlite::Connection,
    key: &ScopeKey,
) -> Result<Option<CreditBalanceRecord>, StoreError> {
    let (kind, agency, sub_account, feature) = scope_params(key);
    Ok(conn
        .query_row(
            "SELECT balance, expires_at_ms, updated_at_ms
             FROM credit_balances
             WHERE scope_kind=?1 AND agency_id=?2 AND sub_account_id=?3 AND feature_key=?4",
            rusqlite::params![kind, agency, sub_account, feature],
            |row| {
                Ok(CreditBalanceRecord {
                    key: key.clone(),
                    balance: row.get::<_, DecimalText>(0)?.0,
                    expires_at_ms: row.get(1)?,
                    updated_at_ms: row.get(2)?,
                })
            },
        )
        .optional()?)
}

fn usage_event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageEventRecord> {
    Ok(UsageEventRecord {
        idempotency_key: row.get(0)?,
        key: scope_key_from_row(row, 1)?,
        quantity: row.get::<_, DecimalText>(5)?.0,
        action_key: row.get(6)?,
        period_start_ms: row.get(7)?,
        usage_before: row.get::<_, DecimalText>(8)?.0,
        usage_after: row.get::<_, DecimalText>(9)?.0,
        max_allowed: row.get::<_, Option<DecimalText>>(10)?.map(|value| value.0),
        credits_consumed: row.get::<_, DecimalText>(11)?.0,
        occurred_at_ms: row.get(12)?,
    })
}

fn credit_entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CreditLedgerRecord> {
    let entry_type: String = row.get(6)?;
    let entry_type = CreditEntryType::parse(&entry_type).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown credit entry type: {entry_type}").into(),
        )
    })?;
    Ok(CreditLedgerRecord {
        id: row.get(0)?,
        idempotency_key: row.get(1)?,
        key: scope_key_from_row(row, 2)?,
        entry_type,
        delta: row.get::<_, DecimalText>(7)?.0,
        reason: row.get(8)?,
        period_start_ms: row.get(9)?,
        period_end_ms: row.get(10)?,
        occurred_at_ms: row.get(11)?,
    })
}

/// Reads `scope_kind, agency_id, sub_account_id, feature_key` starting at `first`.
fn scope_key_from_row(row: &rusqlite::Row<'_>, first: usize) -> rusqlite::Result<ScopeKey> {
    let kind: String = row.get(first)?;
    let kind = ScopeKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            first,
            rusqlite::types::Type::Text,
            format!("unknown scope kind: {kind}").into(),
        )
    })?;
    let scope = Scope::from_columns(kind, row.get(first + 1)?, row.get(first + 2)?);
    Ok(scope.feature(row.get::<_, String>(first + 3)?))
}

fn scope_params(key: &ScopeKey) -> (&'static str, &str, &str, &str) {
    (
        key.scope.kind.as_str(),
        &key.scope.agency_id,
        key.scope.sub_account_column(),
        &key.feature_key,
    )
}

/// Decimals are stored as canonical text so SQLite never coerces them to REAL.
struct DecimalText(Decimal);

impl FromSql for DecimalText {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        Decimal::from_str(raw)
            .map(DecimalText)
            .map_err(|err| FromSqlError::Other(Box::new(err)))
    }
}

fn decimal_text(value: Decimal) -> String {
    value.normalize().to_string()
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS usage_trackers (
            scope_kind TEXT NOT NULL,
            agency_id TEXT NOT NULL,
            sub_account_id TEXT NOT NULL DEFAULT '',
            feature_key TEXT NOT NULL,
            period_start_ms INTEGER NOT NULL,
            current_usage TEXT NOT NULL,
            last_event_at_ms INTEGER NOT NULL,
            PRIMARY KEY (scope_kind, agency_id, sub_account_id, feature_key, period_start_ms)
        );

        CREATE TABLE IF NOT EXISTS usage_events (
            idempotency_key TEXT PRIMARY KEY NOT NULL,
            scope_kind TEXT NOT NULL,
            agency_id TEXT NOT NULL,
            sub_account_id TEXT NOT NULL DEFAULT '',
            feature_key TEXT NOT NULL,
            quantity TEXT NOT NULL,
            action_key TEXT,
            period_start_ms INTEGER NOT NULL,
            usage_before TEXT NOT NULL,
            usage_after TEXT NOT NULL,
            max_allowed TEXT,
            credits_consumed TEXT NOT NULL,
            occurred_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_events_scope_period
            ON usage_events(scope_kind, agency_id, sub_account_id, feature_key, period_start_ms);

        CREATE TABLE IF NOT EXISTS credit_balances (
            scope_kind TEXT NOT NULL,
            agency_id TEXT NOT NULL,
            sub_account_id TEXT NOT NULL DEFAULT '',
            feature_key TEXT NOT NULL,
            balance TEXT NOT NULL,
            expires_at_ms INTEGER,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (scope_kind, agency_id, sub_account_id, feature_key)
        );

        CREATE TABLE IF NOT EXISTS credit_ledger (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            idempotency_key TEXT NOT NULL UNIQUE,
            scope_kind TEXT NOT NULL,
            agency_id TEXT NOT NULL,
            sub_account_id TEXT NOT NULL DEFAULT '',
            feature_key TEXT NOT NULL,
            entry_type TEXT NOT NULL,
            delta TEXT NOT NULL,
            reason TEXT NOT NULL,
            period_start_ms INTEGER,
            period_end_ms INTEGER,
            occurred_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_credit_ledger_scope
            ON credit_ledger(scope_kind, agency_id, sub_account_id, feature_key, id);",
    )?;
    Ok(())
}

fn open_connection(
    path: PathBuf,
    busy_timeout: Duration,
) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}
