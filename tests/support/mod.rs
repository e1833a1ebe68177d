#![allow(dead_code)]

use rust_decimal::Decimal;
use time::OffsetDateTime;
use time::macros::datetime;
use usage_ledger::{
    FeatureEntitlement, MeteringEngine, MeteringStore, PlanEntitlements, Scope, ScopeKey,
    StaticEntitlementResolver, UsagePeriod, UsageRequest,
};

pub const NOW: OffsetDateTime = datetime!(2026-03-15 10:00 UTC);
pub const MARCH_START: OffsetDateTime = datetime!(2026-03-01 0:00 UTC);

pub fn monthly(max: i64) -> FeatureEntitlement {
    FeatureEntitlement::limited(max, Some(UsagePeriod::Monthly))
}

pub fn engine_with(feature: &str, entitlement: FeatureEntitlement) -> MeteringEngine {
    MeteringEngine::new(
        StaticEntitlementResolver::new()
            .with_plan(PlanEntitlements::new("pro").with_feature(feature, entitlement))
            .assign("ag-1", "pro"),
    )
}

pub fn contacts_request(quantity: i64) -> UsageRequest {
    UsageRequest::new(Scope::agency("ag-1"), "contacts", quantity)
}

pub fn contacts_key() -> ScopeKey {
    Scope::agency("ag-1").feature("contacts")
}

pub async fn usage(
    store: &dyn MeteringStore,
    key: &ScopeKey,
    period_start: OffsetDateTime,
) -> Decimal {
    store
        .usage_tracker(key, period_start)
        .await
        .expect("tracker")
        .map(|tracker| tracker.current_usage)
        .unwrap_or_default()
}

pub async fn balance(store: &dyn MeteringStore, key: &ScopeKey) -> Decimal {
    store
        .credit_wallet(key)
        .await
        .expect("wallet")
        .map(|wallet| wallet.balance)
        .unwrap_or_default()
}

pub async fn ledger_sum(store: &dyn MeteringStore, key: &ScopeKey) -> Decimal {
    store
        .list_credit_ledger(key)
        .await
        .expect("ledger")
        .iter()
        .map(|entry| entry.delta)
        .sum()
}

pub async fn top_up(
    engine: &MeteringEngine,
    store: &dyn MeteringStore,
    credits: i64,
    session: &str,
) {
    let outcome = engine
        .apply_top_up_credits_from_checkout(
            store,
            &Scope::agency("ag-1"),
            "contacts",
            Decimal::from(credits),
            session,
            NOW,
        )
        .await
        .expect("top up");
    assert!(outcome.is_applied());
}

pub async fn seed_usage(engine: &MeteringEngine, store: &dyn MeteringStore, quantity: i64) {
    let outcome = engine
        .consume_usage(store, &contacts_request(quantity), "seed", NOW)
        .await
        .expect("seed");
    assert!(outcome.decision.is_allowed());
}
