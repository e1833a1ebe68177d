//! Durable state behind the engine: usage trackers, usage events, credit
//! wallets and the credit ledger.
//!
//! Every mutating operation runs as one transaction inside the store, and the
//! decision that gates it is re-evaluated inside that transaction. Stores share
//! the transactional logic in [`ledger`]; they only differ in how rows are read
//! and written.

mod ledger;
pub mod memory;
#[cfg(feature = "store-sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::decision::UsageDecision;
use crate::entitlement::FeatureEntitlement;
use crate::period::PeriodWindow;
use crate::scope::ScopeKey;

pub use memory::MemoryStore;
#[cfg(feature = "store-sqlite")]
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("decimal overflow in {context}")]
    Overflow { context: &'static str },
    #[error("idempotency key {key} is already used by another ledger")]
    KeyConflict { key: String },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTrackerRecord {
    pub key: ScopeKey,
    pub period_start_ms: i64,
    pub current_usage: Decimal,
    pub last_event_at_ms: i64,
}

/// One accepted consumption. The decision it produced is stored with it so a
/// retried request replays the same answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEventRecord {
    pub idempotency_key: String,
    pub key: ScopeKey,
    pub quantity: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_key: Option<String>,
    pub period_start_ms: i64,
    pub usage_before: Decimal,
    pub usage_after: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_allowed: Option<Decimal>,
    pub credits_consumed: Decimal,
    pub occurred_at_ms: i64,
}

impl UsageEventRecord {
    pub fn decision(&self) -> UsageDecision {
        UsageDecision::Allowed {
            current_usage: self.usage_before,
            usage_after: self.usage_after,
            max_allowed: self.max_allowed,
            credits_consumed: self.credits_consumed,
        }
    }

    /// Outcome for a repeated idempotency key. A key presented again for a
    /// different scope still replays the recorded outcome, with a warning.
    pub(crate) fn replay(&self, requested: &ScopeKey) -> ConsumeOutcome {
        if &self.key != requested {
            tracing::warn!(
                idempotency_key = %self.idempotency_key,
                recorded_scope = %self.key,
                requested_scope = %requested,
                "idempotency key replayed against a different scope"
            );
        }
        ConsumeOutcome {
            decision: self.decision(),
            replayed: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreditEntryType {
    Grant,
    Topup,
    Consume,
    /// Drops a stale balance once its expiry has passed.
    Expire,
}

impl CreditEntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Grant => "GRANT",
            Self::Topup => "TOPUP",
            Self::Consume => "CONSUME",
            Self::Expire => "EXPIRE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "GRANT" => Some(Self::Grant),
            "TOPUP" => Some(Self::Topup),
            "CONSUME" => Some(Self::Consume),
            "EXPIRE" => Some(Self::Expire),
            _ => None,
        }
    }
}

/// Cached wallet balance. Always equal to the sum of the scope's ledger deltas.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalanceRecord {
    pub key: ScopeKey,
    pub balance: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
    pub updated_at_ms: i64,
}

impl CreditBalanceRecord {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|expires| expires <= now_ms)
    }

    /// Spendable balance: an expired wallet reads as zero even before the
    /// stored value is cleared.
    pub fn available(&self, now_ms: i64) -> Decimal {
        if self.is_expired(now_ms) {
            Decimal::ZERO
        } else {
            self.balance.max(Decimal::ZERO)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditLedgerRecord {
    pub id: i64,
    pub idempotency_key: String,
    pub key: ScopeKey,
    pub entry_type: CreditEntryType,
    pub delta: Decimal,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_start_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_end_ms: Option<i64>,
    pub occurred_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct ConsumeRequest {
    pub key: ScopeKey,
    pub quantity: Decimal,
    pub action_key: Option<String>,
    pub idempotency_key: String,
    /// Ledger key for the credit consumption an overage triggers.
    pub overage_idempotency_key: String,
    pub window: PeriodWindow,
    pub entitlement: FeatureEntitlement,
    pub now: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeOutcome {
    pub decision: UsageDecision,
    /// True when the idempotency key was already recorded and nothing changed.
    pub replayed: bool,
}

#[derive(Clone, Debug)]
pub struct CreditDelta {
    pub key: ScopeKey,
    pub entry_type: CreditEntryType,
    pub delta: Decimal,
    pub idempotency_key: String,
    pub reason: String,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    /// Replaces the wallet expiry when set.
    pub expires_at: Option<OffsetDateTime>,
    pub now: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CreditOutcome {
    Applied {
        entry: CreditLedgerRecord,
        balance: Decimal,
    },
    Duplicate {
        entry: CreditLedgerRecord,
    },
    Insufficient {
        available: Decimal,
        requested: Decimal,
    },
}

impl CreditOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Storage handle passed into every engine operation.
#[async_trait]
pub trait MeteringStore: Send + Sync {
    /// Read-only; never creates a tracker row.
    async fn usage_tracker(
        &self,
        key: &ScopeKey,
        period_start: OffsetDateTime,
    ) -> Result<Option<UsageTrackerRecord>, StoreError>;

    async fn usage_event(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<UsageEventRecord>, StoreError>;

    async fn credit_wallet(&self, key: &ScopeKey)
    -> Result<Option<CreditBalanceRecord>, StoreError>;

    /// Re-decides and, when allowed, commits the usage event, the tracker
    /// update and any overage credit consumption in one transaction.
    async fn consume_usage(&self, request: ConsumeRequest) -> Result<ConsumeOutcome, StoreError>;

    /// Applies a ledger entry and the matching balance change atomically.
    /// A delta that would drive the balance negative is refused untouched.
    async fn apply_credit_delta(&self, delta: CreditDelta) -> Result<CreditOutcome, StoreError>;

    async fn list_usage_events(&self, key: &ScopeKey)
    -> Result<Vec<UsageEventRecord>, StoreError>;

    async fn list_credit_ledger(
        &self,
        key: &ScopeKey,
    ) -> Result<Vec<CreditLedgerRecord>, StoreError>;
}

pub fn unix_millis(at: OffsetDateTime) -> i64 {
    let millis = at.unix_timestamp_nanos() / 1_000_000;
    i64::try_from(millis).unwrap_or(if millis < 0 { i64::MIN } else { i64::MAX })
}

pub fn from_unix_millis(ms: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
}
