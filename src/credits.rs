//! Credit wallet operations: recurring plan grants, checkout top-ups, direct
//! consumption and ledger reconciliation.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::engine::MeteringEngine;
use crate::error::{MeteringError, Result};
use crate::period::{self, UsagePeriod};
use crate::scope::{Scope, ScopeKey};
use crate::store::{CreditDelta, CreditEntryType, CreditOutcome, MeteringStore, unix_millis};

const OVERAGE_KEY_PREFIX: &str = "usage-overage:";
const RECURRING_KEY_PREFIX: &str = "recurring:";

/// Ledger key for the credit consumption triggered by the usage event `usage_key`.
pub fn overage_idempotency_key(usage_key: &str) -> String {
    format!("{OVERAGE_KEY_PREFIX}{usage_key}")
}

/// One grant per scope, feature and billing period.
pub fn recurring_grant_key(key: &ScopeKey, period_start: OffsetDateTime) -> String {
    format!(
        "{RECURRING_KEY_PREFIX}{}:{}",
        key.canonical(),
        unix_millis(period_start)
    )
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringGrantReport {
    pub agency_id: String,
    pub plan_id: String,
    /// Features credited by this call.
    pub granted: Vec<String>,
    /// Features whose grant for the period already existed.
    pub already_granted: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalanceView {
    pub key: ScopeKey,
    pub balance: Decimal,
    /// Zero once the wallet has expired.
    pub available: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub key: ScopeKey,
    pub ledger_sum: Decimal,
    pub cached_balance: Decimal,
    pub drift: Decimal,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.drift.is_zero()
    }
}

impl MeteringEngine {
    /// Grants every credit-enabled feature of `plan_id` its recurring amount
    /// for the billing period containing `now`. Features without a period are
    /// granted monthly. Re-running for a period already granted adds nothing.
    #[tracing::instrument(skip_all, fields(agency_id = %agency_id, plan_id = %plan_id))]
    pub async fn grant_recurring_credits_for_agency(
        &self,
        store: &dyn MeteringStore,
        agency_id: &str,
        plan_id: &str,
        now: OffsetDateTime,
    ) -> Result<RecurringGrantReport> {
        let scope = Scope::agency(agency_id);
        scope.validate()?;

        let Some(plan) = self.resolver().plan(plan_id).await? else {
            return Err(MeteringError::InvalidRequest {
                reason: format!("unknown plan {plan_id}"),
            });
        };

        let mut report = RecurringGrantReport {
            agency_id: agency_id.to_string(),
            plan_id: plan.id.clone(),
            ..RecurringGrantReport::default()
        };

        for (feature_key, entitlement) in &plan.features {
            if !entitlement.enabled || !entitlement.credit_enabled {
                continue;
            }
            let Some(credits) = entitlement
                .recurring_credits
                .filter(|credits| *credits > Decimal::ZERO)
            else {
                continue;
            };

            let key = checked_key(&scope.feature(feature_key.clone()))?;
            let window = period::window(entitlement.period.unwrap_or(UsagePeriod::Monthly), now)?;
            let outcome = store
                .apply_credit_delta(CreditDelta {
                    idempotency_key: recurring_grant_key(&key, window.start),
                    key,
                    entry_type: CreditEntryType::Grant,
                    delta: credits,
                    reason: format!("recurring grant from plan {}", plan.id),
                    period_start: Some(window.start),
                    period_end: window.end,
                    expires_at: if entitlement.credit_expires {
                        window.end
                    } else {
                        None
                    },
                    now,
                })
                .await?;

            match outcome {
                CreditOutcome::Applied { balance, .. } => {
                    tracing::info!(
                        feature = %feature_key,
                        credits = %credits,
                        balance = %balance,
                        "recurring credits granted"
                    );
                    report.granted.push(feature_key.clone());
                }
                CreditOutcome::Duplicate { .. } => {
                    tracing::debug!(feature = %feature_key, "recurring credits already granted");
                    report.already_granted.push(feature_key.clone());
                }
                CreditOutcome::Insufficient { .. } => {
                    tracing::warn!(feature = %feature_key, "positive grant refused by store");
                }
            }
        }

        Ok(report)
    }

    /// Payment-completion hook. The payment session id is the idempotency key,
    /// so a redelivered notification is a no-op.
    #[tracing::instrument(
        skip_all,
        fields(scope = %scope, feature = %feature_key, payment_session_id = %payment_session_id)
    )]
    pub async fn apply_top_up_credits_from_checkout(
        &self,
        store: &dyn MeteringStore,
        scope: &Scope,
        feature_key: &str,
        credits: Decimal,
        payment_session_id: &str,
        now: OffsetDateTime,
    ) -> Result<CreditOutcome> {
        let key = checked_key(&scope.feature(feature_key))?;
        require_positive(credits, "top-up credits")?;
        require_idempotency_key(payment_session_id)?;

        let outcome = store
            .apply_credit_delta(CreditDelta {
                key,
                entry_type: CreditEntryType::Topup,
                delta: credits,
                idempotency_key: payment_session_id.to_string(),
                reason: "checkout top-up".to_string(),
                period_start: None,
                period_end: None,
                expires_at: None,
                now,
            })
            .await?;
        log_credit_outcome("top_up", &outcome);
        Ok(outcome)
    }

    /// Spends `amount` credits directly. An expired balance counts as zero;
    /// a shortfall is reported as `Insufficient` and nothing is written.
    #[tracing::instrument(
        skip_all,
        fields(key = %key, amount = %amount, idempotency_key = %idempotency_key)
    )]
    pub async fn consume_credits(
        &self,
        store: &dyn MeteringStore,
        key: &ScopeKey,
        amount: Decimal,
        idempotency_key: &str,
        now: OffsetDateTime,
    ) -> Result<CreditOutcome> {
        let key = checked_key(key)?;
        require_positive(amount, "credit amount")?;
        require_idempotency_key(idempotency_key)?;

        let outcome = store
            .apply_credit_delta(CreditDelta {
                key,
                entry_type: CreditEntryType::Consume,
                delta: -amount,
                idempotency_key: idempotency_key.to_string(),
                reason: "direct credit consumption".to_string(),
                period_start: None,
                period_end: None,
                expires_at: None,
                now,
            })
            .await?;
        log_credit_outcome("consume", &outcome);
        Ok(outcome)
    }

    pub async fn credit_balance(
        &self,
        store: &dyn MeteringStore,
        key: &ScopeKey,
        now: OffsetDateTime,
    ) -> Result<CreditBalanceView> {
        let key = checked_key(key)?;
        let view = match store.credit_wallet(&key).await? {
            Some(wallet) => CreditBalanceView {
                available: wallet.available(unix_millis(now)),
                balance: wallet.balance,
                expires_at_ms: wallet.expires_at_ms,
                key,
            },
            None => CreditBalanceView {
                key,
                balance: Decimal::ZERO,
                available: Decimal::ZERO,
                expires_at_ms: None,
            },
        };
        Ok(view)
    }

    /// Compares the cached balance with the sum of ledger deltas. Read-only.
    pub async fn reconcile_credit_balance(
        &self,
        store: &dyn MeteringStore,
        key: &ScopeKey,
    ) -> Result<ReconcileReport> {
        let key = checked_key(key)?;
        let ledger_sum = store
            .list_credit_ledger(&key)
            .await?
            .iter()
            .map(|entry| entry.delta)
            .sum::<Decimal>();
        let cached_balance = store
            .credit_wallet(&key)
            .await?
            .map(|wallet| wallet.balance)
            .unwrap_or_default();

        let report = ReconcileReport {
            drift: cached_balance - ledger_sum,
            key,
            ledger_sum,
            cached_balance,
        };
        if !report.is_consistent() {
            tracing::warn!(
                key = %report.key,
                drift = %report.drift,
                "credit balance drifted from ledger"
            );
        }
        Ok(report)
    }
}

fn checked_key(key: &ScopeKey) -> Result<ScopeKey> {
    key.validate()?;
    Ok(key.canonical())
}

fn require_positive(amount: Decimal, what: &str) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(MeteringError::InvalidRequest {
            reason: format!("{what} must be positive: {amount}"),
        });
    }
    Ok(())
}

fn require_idempotency_key(idempotency_key: &str) -> Result<()> {
    if idempotency_key.trim().is_empty() {
        return Err(MeteringError::InvalidRequest {
            reason: "idempotency key is required".to_string(),
        });
    }
    Ok(())
}

fn log_credit_outcome(operation: &'static str, outcome: &CreditOutcome) {
    match outcome {
        CreditOutcome::Applied { entry, balance } => {
            tracing::info!(
                operation,
                delta = %entry.delta,
                balance = %balance,
                "credit delta applied"
            );
        }
        CreditOutcome::Duplicate { entry } => {
            tracing::debug!(operation, ledger_id = entry.id, "credit delta already applied");
        }
        CreditOutcome::Insufficient {
            available,
            requested,
        } => {
            tracing::info!(
                operation,
                available = %available,
                requested = %requested,
                "insufficient credits"
            );
        }
    }
}
