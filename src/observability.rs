use std::sync::Mutex;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::decision::{RejectReason, UsageDecision};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub checks: u64,
    pub consumes: u64,
    pub allowed: u64,
    pub replays: u64,
    pub overage_funded: u64,
    pub credits_consumed: Decimal,
    pub no_subscription: u64,
    pub feature_disabled: u64,
    pub limit_exceeded: u64,
    pub insufficient_credits: u64,
    pub invalid_scope: u64,
    pub invalid_quantity: u64,
}

#[derive(Debug, Default)]
pub struct Observability {
    snapshot: Mutex<ObservabilitySnapshot>,
}

impl Observability {
    pub fn record_check(&self, decision: &UsageDecision) {
        self.update(|snapshot| {
            snapshot.checks = snapshot.checks.saturating_add(1);
            record_decision(snapshot, decision);
        });
    }

    pub fn record_consume(&self, decision: &UsageDecision, replayed: bool) {
        self.update(|snapshot| {
            snapshot.consumes = snapshot.consumes.saturating_add(1);
            if replayed {
                snapshot.replays = snapshot.replays.saturating_add(1);
                return;
            }
            record_decision(snapshot, decision);
            let credits = decision.credits_consumed();
            if !credits.is_zero() {
                snapshot.overage_funded = snapshot.overage_funded.saturating_add(1);
                snapshot.credits_consumed = snapshot
                    .credits_consumed
                    .checked_add(credits)
                    .unwrap_or(Decimal::MAX);
            }
        });
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        self.snapshot
            .lock()
            .map(|snapshot| snapshot.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn update(&self, f: impl FnOnce(&mut ObservabilitySnapshot)) {
        let mut snapshot = self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut snapshot);
    }
}

fn record_decision(snapshot: &mut ObservabilitySnapshot, decision: &UsageDecision) {
    let counter = match decision.reject_reason() {
        None => &mut snapshot.allowed,
        Some(RejectReason::NoSubscription) => &mut snapshot.no_subscription,
        Some(RejectReason::FeatureDisabled) => &mut snapshot.feature_disabled,
        Some(RejectReason::LimitExceeded) => &mut snapshot.limit_exceeded,
        Some(RejectReason::InsufficientCredits) => &mut snapshot.insufficient_credits,
        Some(RejectReason::InvalidScope) => &mut snapshot.invalid_scope,
        Some(RejectReason::InvalidQuantity) => &mut snapshot.invalid_quantity,
    };
    *counter = counter.saturating_add(1);
}

/// Installs the global subscriber: `RUST_LOG` filtering with an `info`
/// default, human-readable or JSON lines.
pub fn init_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tracing_subscriber::Layer as _;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}
