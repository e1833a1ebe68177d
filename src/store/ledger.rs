use rust_decimal::Decimal;

use super::{
    ConsumeOutcome, ConsumeRequest, CreditBalanceRecord, CreditDelta, CreditEntryType,
    CreditLedgerRecord, CreditOutcome, StoreError, UsageEventRecord, UsageTrackerRecord,
    unix_millis,
};
use crate::decision::{UsageDecision, assess};
use crate::scope::ScopeKey;

/// Row-level access inside one open transaction. Implementations must not
/// commit; the caller commits once the whole operation has succeeded.
pub(crate) trait LedgerTx {
    fn usage_event(&mut self, idempotency_key: &str)
    -> Result<Option<UsageEventRecord>, StoreError>;

    fn usage_tracker(
        &mut self,
        key: &ScopeKey,
        period_start_ms: i64,
    ) -> Result<Option<UsageTrackerRecord>, StoreError>;

    /// Conflict-tolerant create with zero usage.
    fn ensure_usage_tracker(
        &mut self,
        key: &ScopeKey,
        period_start_ms: i64,
        now_ms: i64,
    ) -> Result<(), StoreError>;

    fn set_usage(
        &mut self,
        key: &ScopeKey,
        period_start_ms: i64,
        usage: Decimal,
        now_ms: i64,
    ) -> Result<(), StoreError>;

    fn insert_usage_event(&mut self, event: &UsageEventRecord) -> Result<(), StoreError>;

    fn credit_wallet(&mut self, key: &ScopeKey) -> Result<Option<CreditBalanceRecord>, StoreError>;

    /// Conflict-tolerant create with a zero balance.
    fn ensure_credit_wallet(&mut self, key: &ScopeKey, now_ms: i64) -> Result<(), StoreError>;

    fn set_credit_wallet(
        &mut self,
        key: &ScopeKey,
        balance: Decimal,
        expires_at_ms: Option<i64>,
        now_ms: i64,
    ) -> Result<(), StoreError>;

    fn credit_entry(&mut self, idempotency_key: &str)
    -> Result<Option<CreditLedgerRecord>, StoreError>;

    /// `entry.id` is ignored; the stored id is returned.
    fn insert_credit_entry(
        &mut self,
        entry: &CreditLedgerRecord,
    ) -> Result<CreditLedgerRecord, StoreError>;
}

pub(crate) fn consume_usage<T: LedgerTx + ?Sized>(
    tx: &mut T,
    request: &ConsumeRequest,
) -> Result<ConsumeOutcome, StoreError> {
    if let Some(existing) = tx.usage_event(&request.idempotency_key)? {
        return Ok(existing.replay(&request.key));
    }

    let now_ms = unix_millis(request.now);
    let period_start_ms = unix_millis(request.window.start);

    let current_usage = tx
        .usage_tracker(&request.key, period_start_ms)?
        .map(|tracker| tracker.current_usage)
        .unwrap_or_default();

    let assessment = assess(&request.entitlement, current_usage, request.quantity)
        .ok_or(StoreError::Overflow { context: "usage" })?;

    let wallet = if assessment.needs_credits() {
        tx.credit_wallet(&request.key)?
    } else {
        None
    };
    let available = wallet
        .as_ref()
        .map(|wallet| wallet.available(now_ms))
        .unwrap_or_default();

    let decision = assessment.settle(available);
    let UsageDecision::Allowed {
        current_usage,
        usage_after,
        max_allowed,
        credits_consumed,
    } = decision.clone()
    else {
        return Ok(ConsumeOutcome {
            decision,
            replayed: false,
        });
    };

    // Everything that can fail is computed before the first write.
    let credit_write = if credits_consumed > Decimal::ZERO {
        let Some(wallet) = wallet else {
            return Err(StoreError::Corrupt(format!(
                "credits settled without a wallet for {}",
                request.key
            )));
        };
        if tx.credit_entry(&request.overage_idempotency_key)?.is_some() {
            return Err(StoreError::KeyConflict {
                key: request.overage_idempotency_key.clone(),
            });
        }
        let balance = wallet
            .balance
            .checked_sub(credits_consumed)
            .ok_or(StoreError::Overflow { context: "credit balance" })?;
        Some((wallet, balance))
    } else {
        None
    };

    tx.ensure_usage_tracker(&request.key, period_start_ms, now_ms)?;
    tx.set_usage(&request.key, period_start_ms, usage_after, now_ms)?;
    tx.insert_usage_event(&UsageEventRecord {
        idempotency_key: request.idempotency_key.clone(),
        key: request.key.clone(),
        quantity: request.quantity,
        action_key: request.action_key.clone(),
        period_start_ms,
        usage_before: current_usage,
        usage_after,
        max_allowed,
        credits_consumed,
        occurred_at_ms: now_ms,
    })?;

    if let Some((wallet, balance)) = credit_write {
        tx.insert_credit_entry(&CreditLedgerRecord {
            id: 0,
            idempotency_key: request.overage_idempotency_key.clone(),
            key: request.key.clone(),
            entry_type: CreditEntryType::Consume,
            delta: -credits_consumed,
            reason: format!("usage overage for {}", request.idempotency_key),
            period_start_ms: Some(period_start_ms),
            period_end_ms: request.window.end.map(unix_millis),
            occurred_at_ms: now_ms,
        })?;
        tx.set_credit_wallet(&request.key, balance, wallet.expires_at_ms, now_ms)?;
    }

    Ok(ConsumeOutcome {
        decision,
        replayed: false,
    })
}

pub(crate) fn apply_credit_delta<T: LedgerTx + ?Sized>(
    tx: &mut T,
    delta: &CreditDelta,
) -> Result<CreditOutcome, StoreError> {
    if let Some(entry) = tx.credit_entry(&delta.idempotency_key)? {
        return Ok(CreditOutcome::Duplicate { entry });
    }

    let now_ms = unix_millis(delta.now);
    let wallet = tx.credit_wallet(&delta.key)?;

    let mut balance = Decimal::ZERO;
    let mut expires_at_ms = None;
    let mut expire_entry = None;
    if let Some(wallet) = &wallet {
        if wallet.is_expired(now_ms) {
            if !wallet.balance.is_zero() {
                expire_entry = Some(CreditLedgerRecord {
                    id: 0,
                    idempotency_key: format!("expire:{}", delta.idempotency_key),
                    key: delta.key.clone(),
                    entry_type: CreditEntryType::Expire,
                    delta: -wallet.balance,
                    reason: "credits expired".to_string(),
                    period_start_ms: None,
                    period_end_ms: wallet.expires_at_ms,
                    occurred_at_ms: now_ms,
                });
            }
        } else {
            balance = wallet.balance;
            expires_at_ms = wallet.expires_at_ms;
        }
    }

    let next_balance = balance
        .checked_add(delta.delta)
        .ok_or(StoreError::Overflow { context: "credit balance" })?;
    if delta.delta < Decimal::ZERO && next_balance < Decimal::ZERO {
        return Ok(CreditOutcome::Insufficient {
            available: balance,
            requested: -delta.delta,
        });
    }
    if let Some(expire) = &expire_entry {
        if tx.credit_entry(&expire.idempotency_key)?.is_some() {
            return Err(StoreError::KeyConflict {
                key: expire.idempotency_key.clone(),
            });
        }
    }
    let expires_at_ms = delta.expires_at.map(unix_millis).or(expires_at_ms);

    tx.ensure_credit_wallet(&delta.key, now_ms)?;
    if let Some(expire) = &expire_entry {
        tx.insert_credit_entry(expire)?;
    }
    let entry = tx.insert_credit_entry(&CreditLedgerRecord {
        id: 0,
        idempotency_key: delta.idempotency_key.clone(),
        key: delta.key.clone(),
        entry_type: delta.entry_type,
        delta: delta.delta,
        reason: delta.reason.clone(),
        period_start_ms: delta.period_start.map(unix_millis),
        period_end_ms: delta.period_end.map(unix_millis),
        occurred_at_ms: now_ms,
    })?;
    tx.set_credit_wallet(&delta.key, next_balance, expires_at_ms, now_ms)?;

    Ok(CreditOutcome::Applied {
        entry,
        balance: next_balance,
    })
}
