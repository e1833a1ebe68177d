//! Entry points callers use: a read-only `check_usage` and an atomic,
//! idempotent `consume_usage`.
//!
//! The storage handle is passed into every call. Entitlements are resolved
//! before any store transaction opens, so no transaction waits on the resolver.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::credits::overage_idempotency_key;
use crate::decision::{RejectReason, UsageDecision, assess};
use crate::entitlement::{EntitlementResolver, FeatureEntitlement};
use crate::error::{MeteringError, Result};
use crate::observability::{Observability, ObservabilitySnapshot};
use crate::period::{self, PeriodWindow, UsagePeriod};
use crate::scope::{Scope, ScopeKey};
use crate::store::{ConsumeOutcome, ConsumeRequest, MeteringStore, StoreError, unix_millis};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRequest {
    pub scope: Scope,
    pub feature_key: String,
    pub quantity: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_key: Option<String>,
}

impl UsageRequest {
    pub fn new(scope: Scope, feature_key: impl Into<String>, quantity: impl Into<Decimal>) -> Self {
        Self {
            scope,
            feature_key: feature_key.into(),
            quantity: quantity.into(),
            action_key: None,
        }
    }

    pub fn with_action(mut self, action_key: impl Into<String>) -> Self {
        self.action_key = Some(action_key.into());
        self
    }

    pub fn key(&self) -> ScopeKey {
        self.scope.canonical().feature(self.feature_key.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageWindowReport {
    pub period_start_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_end_ms: Option<i64>,
    pub usage: Decimal,
}

/// Source of `now` for callers that do not carry their own instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Orchestrates entitlement lookup, windowing, usage and credits.
pub struct MeteringEngine {
    resolver: Arc<dyn EntitlementResolver>,
    observability: Observability,
}

enum Prepared {
    Rejected(UsageDecision),
    Ready {
        key: ScopeKey,
        entitlement: FeatureEntitlement,
        window: PeriodWindow,
    },
}

impl MeteringEngine {
    pub fn new(resolver: impl EntitlementResolver + 'static) -> Self {
        Self::with_resolver(Arc::new(resolver))
    }

    pub fn with_resolver(resolver: Arc<dyn EntitlementResolver>) -> Self {
        Self {
            resolver,
            observability: Observability::default(),
        }
    }

    pub fn resolver(&self) -> &dyn EntitlementResolver {
        self.resolver.as_ref()
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }

    /// Pure projection of `consume_usage`: never creates rows, never writes.
    #[tracing::instrument(
        skip_all,
        fields(scope = %request.scope, feature = %request.feature_key, quantity = %request.quantity)
    )]
    pub async fn check_usage(
        &self,
        store: &dyn MeteringStore,
        request: &UsageRequest,
        now: OffsetDateTime,
    ) -> Result<UsageDecision> {
        let decision = match self.prepare(request, now).await? {
            Prepared::Rejected(decision) => decision,
            Prepared::Ready {
                key,
                entitlement,
                window,
            } => {
                let current_usage = store
                    .usage_tracker(&key, window.start)
                    .await?
                    .map(|tracker| tracker.current_usage)
                    .unwrap_or_default();
                let assessment = assess(&entitlement, current_usage, request.quantity)
                    .ok_or(StoreError::Overflow { context: "usage" })?;
                let available = if assessment.needs_credits() {
                    store
                        .credit_wallet(&key)
                        .await?
                        .map(|wallet| wallet.available(unix_millis(now)))
                        .unwrap_or_default()
                } else {
                    Decimal::ZERO
                };
                assessment.settle(available)
            }
        };

        self.observability.record_check(&decision);
        log_decision("check", &decision);
        Ok(decision)
    }

    /// Decides and, when allowed, commits usage plus any overage credit
    /// consumption atomically. A known idempotency key replays the recorded
    /// outcome without touching state.
    #[tracing::instrument(
        skip_all,
        fields(
            scope = %request.scope,
            feature = %request.feature_key,
            quantity = %request.quantity,
            idempotency_key = %idempotency_key
        )
    )]
    pub async fn consume_usage(
        &self,
        store: &dyn MeteringStore,
        request: &UsageRequest,
        idempotency_key: &str,
        now: OffsetDateTime,
    ) -> Result<ConsumeOutcome> {
        if idempotency_key.trim().is_empty() {
            return Err(MeteringError::InvalidRequest {
                reason: "idempotency key is required".to_string(),
            });
        }

        let outcome = match store.usage_event(idempotency_key).await? {
            Some(event) => event.replay(&request.key()),
            None => match self.prepare(request, now).await? {
                Prepared::Rejected(decision) => ConsumeOutcome {
                    decision,
                    replayed: false,
                },
                Prepared::Ready {
                    key,
                    entitlement,
                    window,
                } => store
                    .consume_usage(ConsumeRequest {
                        key,
                        quantity: request.quantity,
                        action_key: request.action_key.clone(),
                        idempotency_key: idempotency_key.to_string(),
                        overage_idempotency_key: overage_idempotency_key(idempotency_key),
                        window,
                        entitlement,
                        now,
                    })
                    .await
                    .inspect_err(|err| tracing::warn!(error = %err, "consume transaction failed"))?,
            },
        };

        self.observability
            .record_consume(&outcome.decision, outcome.replayed);
        if outcome.replayed {
            tracing::debug!("replayed recorded usage event");
        } else {
            log_decision("consume", &outcome.decision);
        }
        Ok(outcome)
    }

    /// Usage for the current window and the `periods_back` windows before it,
    /// newest first. Standing limits have a single lifetime window. The oldest
    /// window is computed first so an out-of-calendar range fails up front.
    pub async fn usage_history(
        &self,
        store: &dyn MeteringStore,
        key: &ScopeKey,
        period: Option<UsagePeriod>,
        periods_back: u32,
        now: OffsetDateTime,
    ) -> Result<Vec<UsageWindowReport>> {
        let key = key.canonical();
        let windows = match period {
            Some(period) => {
                period::window_with_offset(period, periods_back, now)?;
                (0..=periods_back)
                    .map(|back| period::window_with_offset(period, back, now))
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => vec![PeriodWindow::lifetime()],
        };

        let mut out = Vec::with_capacity(windows.len());
        for window in windows {
            let usage = store
                .usage_tracker(&key, window.start)
                .await?
                .map(|tracker| tracker.current_usage)
                .unwrap_or_default();
            out.push(UsageWindowReport {
                period_start_ms: unix_millis(window.start),
                period_end_ms: window.end.map(unix_millis),
                usage,
            });
        }
        Ok(out)
    }

    /// Steps shared by check and consume up to, but excluding, reading usage.
    async fn prepare(&self, request: &UsageRequest, now: OffsetDateTime) -> Result<Prepared> {
        // Validate before canonicalising: the sentinel would hide a
        // sub-account id on an agency scope.
        let requested = request.scope.feature(request.feature_key.clone());
        if let Err(err) = requested.validate() {
            return Ok(Prepared::Rejected(UsageDecision::rejected(
                RejectReason::InvalidScope,
                err.to_string(),
            )));
        }
        let key = requested.canonical();
        if request.quantity <= Decimal::ZERO {
            return Ok(Prepared::Rejected(UsageDecision::rejected(
                RejectReason::InvalidQuantity,
                format!("quantity must be positive: {}", request.quantity),
            )));
        }

        let Some(plan) = self.resolver.resolve(&key.scope).await? else {
            return Ok(Prepared::Rejected(UsageDecision::rejected(
                RejectReason::NoSubscription,
                "no active subscription",
            )));
        };
        let entitlement = match plan.feature(&key.feature_key) {
            Some(entitlement) if entitlement.enabled => entitlement.clone(),
            _ => {
                return Ok(Prepared::Rejected(UsageDecision::rejected(
                    RejectReason::FeatureDisabled,
                    format!("feature {} is not enabled on plan {}", key.feature_key, plan.id),
                )));
            }
        };

        let window = period::window_for(entitlement.period, now)?;
        Ok(Prepared::Ready {
            key,
            entitlement,
            window,
        })
    }
}

fn log_decision(operation: &'static str, decision: &UsageDecision) {
    match decision {
        UsageDecision::Allowed {
            usage_after,
            credits_consumed,
            ..
        } => tracing::debug!(
            operation,
            usage_after = %usage_after,
            credits_consumed = %credits_consumed,
            "usage allowed"
        ),
        UsageDecision::Rejected { reason, message } => tracing::info!(
            operation,
            reason = reason.as_str(),
            message = %message,
            "usage rejected"
        ),
    }
}
