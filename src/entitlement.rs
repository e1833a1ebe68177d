use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::period::UsagePeriod;
use crate::scope::Scope;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OveragePolicy {
    #[default]
    Reject,
    FundWithCredits,
}

/// Plan-derived rules for one feature at one scope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureEntitlement {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub unlimited: bool,
    #[serde(default)]
    pub max_allowed: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<UsagePeriod>,
    #[serde(default)]
    pub overage_policy: OveragePolicy,
    #[serde(default)]
    pub credit_enabled: bool,
    #[serde(default)]
    pub credit_expires: bool,
    /// Credits granted once per billing period by the recurring-grant trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurring_credits: Option<Decimal>,
}

fn default_enabled() -> bool {
    true
}

impl FeatureEntitlement {
    pub fn limited(max_allowed: impl Into<Decimal>, period: Option<UsagePeriod>) -> Self {
        Self {
            enabled: true,
            unlimited: false,
            max_allowed: max_allowed.into(),
            period,
            overage_policy: OveragePolicy::Reject,
            credit_enabled: false,
            credit_expires: false,
            recurring_credits: None,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            unlimited: true,
            ..Self::limited(0, None)
        }
    }

    pub fn with_credit_overage(mut self) -> Self {
        self.overage_policy = OveragePolicy::FundWithCredits;
        self.credit_enabled = true;
        self
    }

    pub fn with_recurring_credits(mut self, credits: impl Into<Decimal>, expires: bool) -> Self {
        self.credit_enabled = true;
        self.recurring_credits = Some(credits.into());
        self.credit_expires = expires;
        self
    }

    pub fn funds_overage_with_credits(&self) -> bool {
        self.overage_policy == OveragePolicy::FundWithCredits && self.credit_enabled
    }
}

/// A snapshot of everything a plan entitles a scope to.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanEntitlements {
    pub id: String,
    #[serde(default)]
    pub features: BTreeMap<String, FeatureEntitlement>,
}

impl PlanEntitlements {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            features: BTreeMap::new(),
        }
    }

    pub fn with_feature(mut self, key: impl Into<String>, entitlement: FeatureEntitlement) -> Self {
        self.features.insert(key.into(), entitlement);
        self
    }

    pub fn feature(&self, key: &str) -> Option<&FeatureEntitlement> {
        self.features.get(key)
    }
}

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("entitlement lookup failed: {message}")]
    Lookup { message: String },
}

/// Answers what a scope's active plan allows. Implementations live outside
/// this crate; the engine treats each answer as a snapshot valid at call time.
#[async_trait]
pub trait EntitlementResolver: Send + Sync {
    /// `None` means the scope has no active plan.
    async fn resolve(&self, scope: &Scope) -> Result<Option<PlanEntitlements>, ResolverError>;

    async fn plan(&self, plan_id: &str) -> Result<Option<PlanEntitlements>, ResolverError>;
}

/// Resolver over a fixed plan catalog, keyed by agency. Sub-accounts inherit
/// their agency's plan.
#[derive(Clone, Debug, Default)]
pub struct StaticEntitlementResolver {
    plans: HashMap<String, PlanEntitlements>,
    agencies: HashMap<String, String>,
}

impl StaticEntitlementResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, plan: PlanEntitlements) -> Self {
        self.plans.insert(plan.id.clone(), plan);
        self
    }

    pub fn assign(mut self, agency_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        self.agencies.insert(agency_id.into(), plan_id.into());
        self
    }
}

#[async_trait]
impl EntitlementResolver for StaticEntitlementResolver {
    async fn resolve(&self, scope: &Scope) -> Result<Option<PlanEntitlements>, ResolverError> {
        Ok(self
            .agencies
            .get(&scope.agency_id)
            .and_then(|plan_id| self.plans.get(plan_id))
            .cloned())
    }

    async fn plan(&self, plan_id: &str) -> Result<Option<PlanEntitlements>, ResolverError> {
        Ok(self.plans.get(plan_id).cloned())
    }
}
