pub mod config;
pub mod credits;
pub mod decision;
pub mod engine;
pub mod entitlement;
mod error;
pub mod observability;
pub mod period;
pub mod scope;
pub mod store;

pub use config::{ConfigError, MeteringConfig, StoreConfig};
pub use credits::{
    CreditBalanceView, ReconcileReport, RecurringGrantReport, overage_idempotency_key,
    recurring_grant_key,
};
pub use decision::{RejectReason, UsageDecision};
pub use engine::{Clock, MeteringEngine, SystemClock, UsageRequest, UsageWindowReport};
pub use entitlement::{
    EntitlementResolver, FeatureEntitlement, OveragePolicy, PlanEntitlements, ResolverError,
    StaticEntitlementResolver,
};
pub use error::{MeteringError, Result};
pub use observability::{Observability, ObservabilitySnapshot};
pub use period::{PeriodError, PeriodWindow, UsagePeriod};
pub use scope::{Scope, ScopeError, ScopeKey, ScopeKind};
pub use store::{
    ConsumeOutcome, CreditEntryType, CreditOutcome, MemoryStore, MeteringStore, StoreError,
};

#[cfg(feature = "store-sqlite")]
pub use store::SqliteStore;
