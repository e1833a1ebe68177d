//! Behaviour every `MeteringStore` must share. Each store's test file runs
//! these against a fresh instance.

#![allow(dead_code)]

use std::sync::Arc;

use rust_decimal::Decimal;
use time::macros::datetime;
use usage_ledger::{
    CreditEntryType, CreditOutcome, FeatureEntitlement, MeteringStore, RejectReason, Scope,
    UsageDecision, UsagePeriod, UsageRequest,
};

use crate::support::{
    MARCH_START, NOW, balance, contacts_key, contacts_request, engine_with, ledger_sum, monthly,
    seed_usage, top_up, usage,
};

pub async fn limit_exceeded_under_reject_policy(store: &dyn MeteringStore) {
    let engine = engine_with("contacts", monthly(100));
    seed_usage(&engine, store, 90).await;

    let outcome = engine
        .consume_usage(store, &contacts_request(20), "req-1", NOW)
        .await
        .expect("consume");
    assert_eq!(outcome.decision.reject_reason(), Some(RejectReason::LimitExceeded));
    assert!(!outcome.replayed);
    assert_eq!(usage(store, &contacts_key(), MARCH_START).await, Decimal::from(90));
    assert!(store.usage_event("req-1").await.expect("event").is_none());
}

pub async fn insufficient_credits_leave_state_untouched(store: &dyn MeteringStore) {
    let engine = engine_with("contacts", monthly(100).with_credit_overage());
    seed_usage(&engine, store, 90).await;
    top_up(&engine, store, 5, "cs_1").await;

    let outcome = engine
        .consume_usage(store, &contacts_request(20), "req-1", NOW)
        .await
        .expect("consume");
    assert_eq!(
        outcome.decision.reject_reason(),
        Some(RejectReason::InsufficientCredits)
    );

    let key = contacts_key();
    assert_eq!(usage(store, &key, MARCH_START).await, Decimal::from(90));
    assert_eq!(balance(store, &key).await, Decimal::from(5));
    assert_eq!(store.list_credit_ledger(&key).await.expect("ledger").len(), 1);
    assert_eq!(store.list_usage_events(&key).await.expect("events").len(), 1);
}

pub async fn overage_is_funded_from_credits(store: &dyn MeteringStore) {
    let engine = engine_with("contacts", monthly(100).with_credit_overage());
    seed_usage(&engine, store, 90).await;
    top_up(&engine, store, 15, "cs_1").await;

    let outcome = engine
        .consume_usage(store, &contacts_request(20), "req-1", NOW)
        .await
        .expect("consume");
    assert_eq!(
        outcome.decision,
        UsageDecision::Allowed {
            current_usage: Decimal::from(90),
            usage_after: Decimal::from(110),
            max_allowed: Some(Decimal::from(100)),
            credits_consumed: Decimal::from(10),
        }
    );

    let key = contacts_key();
    assert_eq!(usage(store, &key, MARCH_START).await, Decimal::from(110));
    assert_eq!(balance(store, &key).await, Decimal::from(5));

    let ledger = store.list_credit_ledger(&key).await.expect("ledger");
    let consumed: Vec<_> = ledger
        .iter()
        .filter(|entry| entry.entry_type == CreditEntryType::Consume)
        .collect();
    assert_eq!(consumed.len(), 1);
    assert_eq!(consumed[0].delta, Decimal::from(-10));
    assert_eq!(consumed[0].idempotency_key, "usage-overage:req-1");
    assert_eq!(store.list_usage_events(&key).await.expect("events").len(), 2);
    assert_eq!(ledger_sum(store, &key).await, balance(store, &key).await);
}

pub async fn recurring_grant_is_once_per_period(store: &dyn MeteringStore) {
    let engine = engine_with(
        "contacts",
        monthly(100)
            .with_credit_overage()
            .with_recurring_credits(25, true),
    );

    let first = engine
        .grant_recurring_credits_for_agency(store, "ag-1", "pro", NOW)
        .await
        .expect("first grant");
    assert_eq!(first.granted, vec!["contacts".to_string()]);

    let second = engine
        .grant_recurring_credits_for_agency(store, "ag-1", "pro", datetime!(2026-03-28 8:00 UTC))
        .await
        .expect("second grant");
    assert!(second.granted.is_empty());
    assert_eq!(second.already_granted, vec!["contacts".to_string()]);

    let key = contacts_key();
    let ledger = store.list_credit_ledger(&key).await.expect("ledger");
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].entry_type, CreditEntryType::Grant);
    assert_eq!(balance(store, &key).await, Decimal::from(25));

    let wallet = store.credit_wallet(&key).await.expect("wallet").expect("row");
    assert_eq!(wallet.expires_at_ms, Some(1_775_001_600_000));
}

pub async fn retried_consume_is_counted_once(store: &dyn MeteringStore) {
    let engine = engine_with("contacts", monthly(100).with_credit_overage());
    seed_usage(&engine, store, 95).await;
    top_up(&engine, store, 20, "cs_1").await;

    let request = contacts_request(10).with_action("import");
    let first = engine
        .consume_usage(store, &request, "req-1", NOW)
        .await
        .expect("first");
    let second = engine
        .consume_usage(store, &request, "req-1", NOW)
        .await
        .expect("second");

    assert_eq!(first.decision, second.decision);
    assert!(!first.replayed);
    assert!(second.replayed);

    let key = contacts_key();
    assert_eq!(usage(store, &key, MARCH_START).await, Decimal::from(105));
    assert_eq!(balance(store, &key).await, Decimal::from(15));
    assert_eq!(store.list_credit_ledger(&key).await.expect("ledger").len(), 2);
}

pub async fn tracker_matches_sum_of_events(store: &dyn MeteringStore) {
    let engine = engine_with("contacts", monthly(1_000));
    let quantities = [
        Decimal::new(15, 1),
        Decimal::from(3),
        Decimal::new(25, 2),
        Decimal::from(40),
    ];
    for (idx, quantity) in quantities.iter().enumerate() {
        let request = UsageRequest::new(Scope::agency("ag-1"), "contacts", *quantity);
        let outcome = engine
            .consume_usage(store, &request, &format!("req-{idx}"), NOW)
            .await
            .expect("consume");
        assert!(outcome.decision.is_allowed());
    }

    let key = contacts_key();
    let events = store.list_usage_events(&key).await.expect("events");
    let sum: Decimal = events.iter().map(|event| event.quantity).sum();
    assert_eq!(sum, Decimal::new(4475, 2));
    assert_eq!(usage(store, &key, MARCH_START).await, sum);
}

pub async fn boundary_instants_land_in_their_own_period(store: &dyn MeteringStore) {
    let engine = engine_with("contacts", monthly(10));
    let last_march_instant = datetime!(2026-03-31 23:59:59.999 UTC);
    let first_april_instant = datetime!(2026-04-01 0:00 UTC);

    let march = engine
        .consume_usage(store, &contacts_request(10), "req-march", last_march_instant)
        .await
        .expect("march");
    assert!(march.decision.is_allowed());

    let april = engine
        .consume_usage(store, &contacts_request(4), "req-april", first_april_instant)
        .await
        .expect("april");
    assert!(april.decision.is_allowed());

    let history = engine
        .usage_history(
            store,
            &contacts_key(),
            Some(UsagePeriod::Monthly),
            1,
            first_april_instant,
        )
        .await
        .expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].usage, Decimal::from(4));
    assert_eq!(history[1].usage, Decimal::from(10));
    assert_eq!(history[1].period_end_ms, Some(history[0].period_start_ms));
}

pub async fn check_never_writes(store: &dyn MeteringStore) {
    let engine = engine_with("contacts", monthly(100).with_credit_overage());

    let within = engine
        .check_usage(store, &contacts_request(50), NOW)
        .await
        .expect("check");
    assert!(within.is_allowed());

    let beyond = engine
        .check_usage(store, &contacts_request(150), NOW)
        .await
        .expect("check");
    assert_eq!(beyond.reject_reason(), Some(RejectReason::InsufficientCredits));

    let key = contacts_key();
    assert!(store.usage_tracker(&key, MARCH_START).await.expect("tracker").is_none());
    assert!(store.credit_wallet(&key).await.expect("wallet").is_none());
    assert!(store.list_usage_events(&key).await.expect("events").is_empty());

    let snapshot = engine.observability();
    assert_eq!(snapshot.checks, 2);
    assert_eq!(snapshot.consumes, 0);
}

pub async fn rejects_before_lookup(store: &dyn MeteringStore) {
    let engine = engine_with("contacts", monthly(100));

    let mut malformed = contacts_request(1);
    malformed.scope = Scope::sub_account("ag-1", "");
    let outcome = engine
        .consume_usage(store, &malformed, "req-1", NOW)
        .await
        .expect("consume");
    assert_eq!(outcome.decision.reject_reason(), Some(RejectReason::InvalidScope));

    let mut agency_with_sub_account = contacts_request(5);
    agency_with_sub_account.scope.sub_account_id = Some("sa-1".to_string());
    let outcome = engine
        .consume_usage(store, &agency_with_sub_account, "req-3", NOW)
        .await
        .expect("consume");
    assert_eq!(outcome.decision.reject_reason(), Some(RejectReason::InvalidScope));
    let decision = engine
        .check_usage(store, &agency_with_sub_account, NOW)
        .await
        .expect("check");
    assert_eq!(decision.reject_reason(), Some(RejectReason::InvalidScope));
    assert!(
        store
            .usage_tracker(&contacts_key(), MARCH_START)
            .await
            .expect("tracker")
            .is_none()
    );
    assert!(store.usage_event("req-3").await.expect("event").is_none());

    let outcome = engine
        .consume_usage(store, &contacts_request(0), "req-2", NOW)
        .await
        .expect("consume");
    assert_eq!(outcome.decision.reject_reason(), Some(RejectReason::InvalidQuantity));

    let stranger = UsageRequest::new(Scope::agency("ag-9"), "contacts", 1);
    let decision = engine.check_usage(store, &stranger, NOW).await.expect("check");
    assert_eq!(decision.reject_reason(), Some(RejectReason::NoSubscription));

    let unknown = UsageRequest::new(Scope::agency("ag-1"), "voice_minutes", 1);
    let decision = engine.check_usage(store, &unknown, NOW).await.expect("check");
    assert_eq!(decision.reject_reason(), Some(RejectReason::FeatureDisabled));

    let err = engine
        .consume_usage(store, &contacts_request(1), "  ", NOW)
        .await
        .unwrap_err();
    assert!(matches!(err, usage_ledger::MeteringError::InvalidRequest { .. }));
}

pub async fn standing_limit_never_resets(store: &dyn MeteringStore) {
    let engine = engine_with("sub_accounts", FeatureEntitlement::limited(3, None));
    let request = UsageRequest::new(Scope::agency("ag-1"), "sub_accounts", 2);

    let first = engine
        .consume_usage(store, &request, "create-1", datetime!(2026-01-10 9:00 UTC))
        .await
        .expect("first");
    assert!(first.decision.is_allowed());

    let next_year = engine
        .consume_usage(store, &request, "create-2", datetime!(2027-02-10 9:00 UTC))
        .await
        .expect("second");
    assert_eq!(next_year.decision.reject_reason(), Some(RejectReason::LimitExceeded));
}

pub async fn unlimited_feature_skips_credits(store: &dyn MeteringStore) {
    let engine = engine_with("emails", FeatureEntitlement::unlimited());
    let request = UsageRequest::new(Scope::sub_account("ag-1", "sa-1"), "emails", 1_000_000);

    let outcome = engine
        .consume_usage(store, &request, "blast-1", NOW)
        .await
        .expect("consume");
    assert_eq!(outcome.decision.credits_consumed(), Decimal::ZERO);
    assert!(outcome.decision.is_allowed());
    let key = Scope::sub_account("ag-1", "sa-1").feature("emails");
    assert!(store.credit_wallet(&key).await.expect("wallet").is_none());
}

pub async fn expired_credits_are_written_off(store: &dyn MeteringStore) {
    let engine = engine_with(
        "contacts",
        monthly(100)
            .with_credit_overage()
            .with_recurring_credits(10, true),
    );
    let key = contacts_key();

    engine
        .grant_recurring_credits_for_agency(store, "ag-1", "pro", NOW)
        .await
        .expect("march grant");
    seed_usage(&engine, store, 104).await;
    assert_eq!(balance(store, &key).await, Decimal::from(6));

    let view = engine
        .credit_balance(store, &key, datetime!(2026-04-01 0:00 UTC))
        .await
        .expect("balance");
    assert_eq!(view.balance, Decimal::from(6));
    assert_eq!(view.available, Decimal::ZERO);

    let april = datetime!(2026-04-02 0:00 UTC);
    engine
        .grant_recurring_credits_for_agency(store, "ag-1", "pro", april)
        .await
        .expect("april grant");

    let ledger = store.list_credit_ledger(&key).await.expect("ledger");
    let types: Vec<_> = ledger.iter().map(|entry| entry.entry_type).collect();
    assert_eq!(
        types,
        vec![
            CreditEntryType::Grant,
            CreditEntryType::Consume,
            CreditEntryType::Expire,
            CreditEntryType::Grant,
        ]
    );
    assert_eq!(balance(store, &key).await, Decimal::from(10));

    let report = engine
        .reconcile_credit_balance(store, &key)
        .await
        .expect("reconcile");
    assert!(report.is_consistent());
    assert_eq!(report.ledger_sum, Decimal::from(10));
}

pub async fn direct_consumption_refuses_overdraft(store: &dyn MeteringStore) {
    let engine = engine_with("contacts", monthly(100).with_credit_overage());
    let key = contacts_key();
    top_up(&engine, store, 8, "cs_1").await;

    let refused = engine
        .consume_credits(store, &key, Decimal::from(9), "spend-1", NOW)
        .await
        .expect("consume credits");
    assert_eq!(
        refused,
        CreditOutcome::Insufficient {
            available: Decimal::from(8),
            requested: Decimal::from(9),
        }
    );
    assert_eq!(balance(store, &key).await, Decimal::from(8));

    let spent = engine
        .consume_credits(store, &key, Decimal::from(8), "spend-2", NOW)
        .await
        .expect("consume credits");
    assert!(spent.is_applied());

    let replay = engine
        .consume_credits(store, &key, Decimal::from(8), "spend-2", NOW)
        .await
        .expect("consume credits");
    assert!(matches!(replay, CreditOutcome::Duplicate { .. }));
    assert_eq!(balance(store, &key).await, Decimal::ZERO);
    assert_eq!(ledger_sum(store, &key).await, Decimal::ZERO);
}

pub async fn same_key_from_many_tasks_counts_once<S>(store: S)
where
    S: MeteringStore + Clone + 'static,
{
    let engine = Arc::new(engine_with("contacts", monthly(100).with_credit_overage()));
    seed_usage(&engine, &store, 98).await;
    top_up(&engine, &store, 10, "cs_1").await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = Arc::clone(&engine);
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            engine
                .consume_usage(&store, &contacts_request(5), "req-shared", NOW)
                .await
                .expect("consume")
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.expect("join"));
    }
    assert_eq!(outcomes.iter().filter(|outcome| !outcome.replayed).count(), 1);
    assert!(outcomes.iter().all(|outcome| outcome.decision == outcomes[0].decision));

    let key = contacts_key();
    assert_eq!(usage(&store, &key, MARCH_START).await, Decimal::from(103));
    assert_eq!(balance(&store, &key).await, Decimal::from(7));
    assert_eq!(ledger_sum(&store, &key).await, Decimal::from(7));
}

pub async fn racing_keys_never_overshoot_the_limit<S>(store: S)
where
    S: MeteringStore + Clone + 'static,
{
    let engine = Arc::new(engine_with("contacts", monthly(10)));

    let mut handles = Vec::new();
    for idx in 0..24 {
        let engine = Arc::clone(&engine);
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            engine
                .consume_usage(&store, &contacts_request(1), &format!("req-{idx}"), NOW)
                .await
                .expect("consume")
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await.expect("join").decision.is_allowed() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 10);
    assert_eq!(usage(&store, &contacts_key(), MARCH_START).await, Decimal::from(10));
}
