//! Limit and overage arithmetic shared by the read-only check and the
//! committing consume path.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::entitlement::FeatureEntitlement;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    NoSubscription,
    FeatureDisabled,
    LimitExceeded,
    InsufficientCredits,
    InvalidScope,
    InvalidQuantity,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoSubscription => "NO_SUBSCRIPTION",
            Self::FeatureDisabled => "FEATURE_DISABLED",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
            Self::InsufficientCredits => "INSUFFICIENT_CREDITS",
            Self::InvalidScope => "INVALID_SCOPE",
            Self::InvalidQuantity => "INVALID_QUANTITY",
        }
    }
}

/// Outcome of a usage request. Rejections are values, not errors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UsageDecision {
    Allowed {
        current_usage: Decimal,
        usage_after: Decimal,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_allowed: Option<Decimal>,
        credits_consumed: Decimal,
    },
    Rejected {
        reason: RejectReason,
        message: String,
    },
}

impl UsageDecision {
    pub fn rejected(reason: RejectReason, message: impl Into<String>) -> Self {
        Self::Rejected {
            reason,
            message: message.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Allowed { .. } => None,
            Self::Rejected { reason, .. } => Some(*reason),
        }
    }

    pub fn credits_consumed(&self) -> Decimal {
        match self {
            Self::Allowed {
                credits_consumed, ..
            } => *credits_consumed,
            Self::Rejected { .. } => Decimal::ZERO,
        }
    }
}

/// First half of a decision: everything that can be settled without the
/// credit wallet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Assessment {
    Decided(UsageDecision),
    NeedsCredits {
        current_usage: Decimal,
        usage_after: Decimal,
        max_allowed: Decimal,
        exceed_by: Decimal,
    },
}

/// Returns `None` only when `current + quantity` overflows the decimal range.
pub fn assess(
    entitlement: &FeatureEntitlement,
    current_usage: Decimal,
    quantity: Decimal,
) -> Option<Assessment> {
    let usage_after = current_usage.checked_add(quantity)?;

    if entitlement.unlimited {
        return Some(Assessment::Decided(UsageDecision::Allowed {
            current_usage,
            usage_after,
            max_allowed: None,
            credits_consumed: Decimal::ZERO,
        }));
    }

    let max_allowed = entitlement.max_allowed;
    if usage_after <= max_allowed {
        return Some(Assessment::Decided(UsageDecision::Allowed {
            current_usage,
            usage_after,
            max_allowed: Some(max_allowed),
            credits_consumed: Decimal::ZERO,
        }));
    }

    let exceed_by = usage_after.checked_sub(max_allowed)?;
    if !entitlement.funds_overage_with_credits() {
        return Some(Assessment::Decided(UsageDecision::rejected(
            RejectReason::LimitExceeded,
            format!("usage limit reached: limit={max_allowed} attempted={usage_after}"),
        )));
    }

    Some(Assessment::NeedsCredits {
        current_usage,
        usage_after,
        max_allowed,
        exceed_by,
    })
}

impl Assessment {
    pub fn needs_credits(&self) -> bool {
        matches!(self, Self::NeedsCredits { .. })
    }

    /// All-or-nothing: when the wallet cannot cover the excess, the whole
    /// request is rejected, including the part that would fit the limit.
    pub fn settle(self, available_credits: Decimal) -> UsageDecision {
        match self {
            Self::Decided(decision) => decision,
            Self::NeedsCredits {
                current_usage,
                usage_after,
                max_allowed,
                exceed_by,
            } => {
                if available_credits < exceed_by {
                    UsageDecision::rejected(
                        RejectReason::InsufficientCredits,
                        format!(
                            "insufficient credits: required={} available={}",
                            exceed_by, available_credits
                        ),
                    )
                } else {
                    UsageDecision::Allowed {
                        current_usage,
                        usage_after,
                        max_allowed: Some(max_allowed),
                        credits_consumed: exceed_by,
                    }
                }
            }
        }
    }
}
