mod scenarios;
mod support;

use usage_ledger::MemoryStore;

#[tokio::test]
async fn memory_limit_exceeded_under_reject_policy() {
    scenarios::limit_exceeded_under_reject_policy(&MemoryStore::new()).await;
}

#[tokio::test]
async fn memory_insufficient_credits_leave_state_untouched() {
    scenarios::insufficient_credits_leave_state_untouched(&MemoryStore::new()).await;
}

#[tokio::test]
async fn memory_overage_is_funded_from_credits() {
    scenarios::overage_is_funded_from_credits(&MemoryStore::new()).await;
}

#[tokio::test]
async fn memory_recurring_grant_is_once_per_period() {
    scenarios::recurring_grant_is_once_per_period(&MemoryStore::new()).await;
}

#[tokio::test]
async fn memory_retried_consume_is_counted_once() {
    scenarios::retried_consume_is_counted_once(&MemoryStore::new()).await;
}

#[tokio::test]
async fn memory_tracker_matches_sum_of_events() {
    scenarios::tracker_matches_sum_of_events(&MemoryStore::new()).await;
}

#[tokio::test]
async fn memory_boundary_instants_land_in_their_own_period() {
    scenarios::boundary_instants_land_in_their_own_period(&MemoryStore::new()).await;
}

#[tokio::test]
async fn memory_check_never_writes() {
    scenarios::check_never_writes(&MemoryStore::new()).await;
}

#[tokio::test]
async fn memory_rejects_before_lookup() {
    scenarios::rejects_before_lookup(&MemoryStore::new()).await;
}

#[tokio::test]
async fn memory_standing_limit_never_resets() {
    scenarios::standing_limit_never_resets(&MemoryStore::new()).await;
}

#[tokio::test]
async fn memory_unlimited_feature_skips_credits() {
    scenarios::unlimited_feature_skips_credits(&MemoryStore::new()).await;
}

#[tokio::test]
async fn memory_expired_credits_are_written_off() {
    scenarios::expired_credits_are_written_off(&MemoryStore::new()).await;
}

#[tokio::test]
async fn memory_direct_consumption_refuses_overdraft() {
    scenarios::direct_consumption_refuses_overdraft(&MemoryStore::new()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_same_key_from_many_tasks_counts_once() {
    scenarios::same_key_from_many_tasks_counts_once(MemoryStore::new()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_racing_keys_never_overshoot_the_limit() {
    scenarios::racing_keys_never_overshoot_the_limit(MemoryStore::new()).await;
}
