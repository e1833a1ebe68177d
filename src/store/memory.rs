use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rust_decimal::Decimal;
use time::OffsetDateTime;

use super::ledger::{self, LedgerTx};
use super::{
    ConsumeOutcome, ConsumeRequest, CreditBalanceRecord, CreditDelta, CreditLedgerRecord,
    CreditOutcome, MeteringStore, StoreError, UsageEventRecord, UsageTrackerRecord, unix_millis,
};
use crate::scope::ScopeKey;

/// Process-local store with the same transactional semantics as the durable
/// stores. Each operation holds the state lock for its whole duration.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    trackers: HashMap<(ScopeKey, i64), UsageTrackerRecord>,
    events: Vec<UsageEventRecord>,
    event_index: HashMap<String, usize>,
    wallets: HashMap<ScopeKey, CreditBalanceRecord>,
    ledger: Vec<CreditLedgerRecord>,
    ledger_index: HashMap<String, usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl MeteringStore for MemoryStore {
    async fn usage_tracker(
        &self,
        key: &ScopeKey,
        period_start: OffsetDateTime,
    ) -> Result<Option<UsageTrackerRecord>, StoreError> {
        self.lock()?.usage_tracker(key, unix_millis(period_start))
    }

    async fn usage_event(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<UsageEventRecord>, StoreError> {
        self.lock()?.usage_event(idempotency_key)
    }

    async fn credit_wallet(
        &self,
        key: &ScopeKey,
    ) -> Result<Option<CreditBalanceRecord>, StoreError> {
        self.lock()?.credit_wallet(key)
    }

    async fn consume_usage(&self, request: ConsumeRequest) -> Result<ConsumeOutcome, StoreError> {
        ledger::consume_usage(&mut *self.lock()?, &request)
    }

    async fn apply_credit_delta(&self, delta: CreditDelta) -> Result<CreditOutcome, StoreError> {
        ledger::apply_credit_delta(&mut *self.lock()?, &delta)
    }

    async fn list_usage_events(
        &self,
        key: &ScopeKey,
    ) -> Result<Vec<UsageEventRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .events
            .iter()
            .filter(|event| &event.key == key)
            .cloned()
            .collect())
    }

    async fn list_credit_ledger(
        &self,
        key: &ScopeKey,
    ) -> Result<Vec<CreditLedgerRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .ledger
            .iter()
            .filter(|entry| &entry.key == key)
            .cloned()
            .collect())
    }
}

impl LedgerTx for MemoryState {
    fn usage_event(
        &mut self,
        idempotency_key: &str,
    ) -> Result<Option<UsageEventRecord>, StoreError> {
        Ok(self
            .event_index
            .get(idempotency_key)
            .and_then(|idx| self.events.get(*idx))
            .cloned())
    }

    fn usage_tracker(
        &mut self,
        key: &ScopeKey,
        period_start_ms: i64,
    ) -> Result<Option<UsageTrackerRecord>, StoreError> {
        Ok(self.trackers.get(&(key.clone(), period_start_ms)).cloned())
    }

    fn ensure_usage_tracker(
        &mut self,
        key: &ScopeKey,
        period_start_ms: i64,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        self.trackers
            .entry((key.clone(), period_start_ms))
            .or_insert_with(|| UsageTrackerRecord {
                key: key.clone(),
                period_start_ms,
                current_usage: Decimal::ZERO,
                last_event_at_ms: now_ms,
            });
        Ok(())
    }

    fn set_usage(
        &mut self,
        key: &ScopeKey,
        period_start_ms: i64,
        usage: Decimal,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let tracker = self
            .trackers
            .get_mut(&(key.clone(), period_start_ms))
            .ok_or_else(|| StoreError::Corrupt(format!("missing usage tracker for {key}")))?;
        tracker.current_usage = usage;
        tracker.last_event_at_ms = now_ms;
        Ok(())
    }

    fn insert_usage_event(&mut self, event: &UsageEventRecord) -> Result<(), StoreError> {
        if self.event_index.contains_key(&event.idempotency_key) {
            return Ok(());
        }
        self.event_index
            .insert(event.idempotency_key.clone(), self.events.len());
        self.events.push(event.clone());
        Ok(())
    }

    fn credit_wallet(&mut self, key: &ScopeKey) -> Result<Option<CreditBalanceRecord>, StoreError> {
        Ok(self.wallets.get(key).cloned())
    }

    fn ensure_credit_wallet(&mut self, key: &ScopeKey, now_ms: i64) -> Result<(), StoreError> {
        self.wallets
            .entry(key.clone())
            .or_insert_with(|| CreditBalanceRecord {
                key: key.clone(),
                balance: Decimal::ZERO,
                expires_at_ms: None,
                updated_at_ms: now_ms,
            });
        Ok(())
    }

    fn set_credit_wallet(
        &mut self,
        key: &ScopeKey,
        balance: Decimal,
        expires_at_ms: Option<i64>,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let wallet = self
            .wallets
            .get_mut(key)
            .ok_or_else(|| StoreError::Corrupt(format!("missing credit wallet for {key}")))?;
        wallet.balance = balance;
        wallet.expires_at_ms = expires_at_ms;
        wallet.updated_at_ms = now_ms;
        Ok(())
    }

    fn credit_entry(
        &mut self,
        idempotency_key: &str,
    ) -> Result<Option<CreditLedgerRecord>, StoreError> {
        Ok(self
            .ledger_index
            .get(idempotency_key)
            .and_then(|idx| self.ledger.get(*idx))
            .cloned())
    }

    fn insert_credit_entry(
        &mut self,
        entry: &CreditLedgerRecord,
    ) -> Result<CreditLedgerRecord, StoreError> {
        if let Some(existing) = self.credit_entry(&entry.idempotency_key)? {
            return Err(StoreError::KeyConflict {
                key: existing.idempotency_key,
            });
        }
        let mut stored = entry.clone();
        stored.id = i64::try_from(self.ledger.len()).unwrap_or(i64::MAX - 1) + 1;
        self.ledger_index
            .insert(stored.idempotency_key.clone(), self.ledger.len());
        self.ledger.push(stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlement::FeatureEntitlement;
    use crate::period::{UsagePeriod, window};
    use crate::scope::Scope;
    use crate::store::CreditEntryType;
    use time::macros::datetime;

    fn consume(key: &ScopeKey, idempotency_key: &str, quantity: i64) -> ConsumeRequest {
        let now = datetime!(2026-03-15 10:00 UTC);
        ConsumeRequest {
            key: key.clone(),
            quantity: Decimal::from(quantity),
            action_key: None,
            idempotency_key: idempotency_key.to_string(),
            overage_idempotency_key: format!("usage-overage:{idempotency_key}"),
            window: window(UsagePeriod::Monthly, now).expect("window"),
            entitlement: FeatureEntitlement::limited(10, Some(UsagePeriod::Monthly)),
            now,
        }
    }

    #[tokio::test]
    async fn memory_store_creates_tracker_lazily_and_replays() {
        let store = MemoryStore::new();
        let key = Scope::agency("ag-1").feature("contacts");
        let period_start = datetime!(2026-03-01 0:00 UTC);

        assert!(store.usage_tracker(&key, period_start).await.unwrap().is_none());

        let first = store.consume_usage(consume(&key, "req-1", 4)).await.unwrap();
        assert!(first.decision.is_allowed());
        assert!(!first.replayed);

        let replay = store.consume_usage(consume(&key, "req-1", 4)).await.unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.decision, first.decision);

        let tracker = store
            .usage_tracker(&key, period_start)
            .await
            .unwrap()
            .expect("tracker");
        assert_eq!(tracker.current_usage, Decimal::from(4));
        assert_eq!(store.list_usage_events(&key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_store_refuses_negative_balance() {
        let store = MemoryStore::new();
        let key = Scope::agency("ag-1").feature("emails");
        let now = datetime!(2026-03-15 10:00 UTC);

        let outcome = store
            .apply_credit_delta(CreditDelta {
                key: key.clone(),
                entry_type: CreditEntryType::Consume,
                delta: Decimal::from(-1),
                idempotency_key: "c-1".to_string(),
                reason: "test".to_string(),
                period_start: None,
                period_end: None,
                expires_at: None,
                now,
            })
            .await
            .unwrap();
        assert!(matches!(outcome, CreditOutcome::Insufficient { .. }));
        assert!(store.credit_wallet(&key).await.unwrap().is_none());
        assert!(store.list_credit_ledger(&key).await.unwrap().is_empty());
    }
}
