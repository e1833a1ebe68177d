use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entitlement::{PlanEntitlements, StaticEntitlementResolver};
use crate::scope::validate_feature_key;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MeteringConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub plans: Vec<PlanEntitlements>,
    #[serde(default)]
    pub agencies: Vec<AgencyPlanConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("usage-ledger.sqlite")
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgencyPlanConfig {
    pub id: String,
    pub plan: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse config failed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("duplicate plan id: {0}")]
    DuplicatePlan(String),
    #[error("agency {agency} references unknown plan {plan}")]
    UnknownPlan { agency: String, plan: String },
    #[error("plan {plan} feature {feature}: {reason}")]
    InvalidFeature {
        plan: String,
        feature: String,
        reason: &'static str,
    },
}

impl MeteringConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut plan_ids = HashSet::new();
        for plan in &self.plans {
            if !plan_ids.insert(plan.id.as_str()) {
                return Err(ConfigError::DuplicatePlan(plan.id.clone()));
            }
            for (feature, entitlement) in &plan.features {
                let invalid = |reason| ConfigError::InvalidFeature {
                    plan: plan.id.clone(),
                    feature: feature.clone(),
                    reason,
                };
                if validate_feature_key(feature).is_err() {
                    return Err(invalid("feature key must be non-empty and must not contain '|'"));
                }
                if entitlement.max_allowed < Decimal::ZERO {
                    return Err(invalid("max_allowed must not be negative"));
                }
                if entitlement
                    .recurring_credits
                    .is_some_and(|credits| credits < Decimal::ZERO)
                {
                    return Err(invalid("recurring_credits must not be negative"));
                }
            }
        }

        for agency in &self.agencies {
            if !plan_ids.contains(agency.plan.as_str()) {
                return Err(ConfigError::UnknownPlan {
                    agency: agency.id.clone(),
                    plan: agency.plan.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn resolver(&self) -> StaticEntitlementResolver {
        let resolver = self
            .plans
            .iter()
            .cloned()
            .fold(StaticEntitlementResolver::new(), |resolver, plan| {
                resolver.with_plan(plan)
            });
        self.agencies.iter().fold(resolver, |resolver, agency| {
            resolver.assign(agency.id.clone(), agency.plan.clone())
        })
    }
}
