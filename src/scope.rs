use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopeKind {
    Agency,
    #[serde(rename = "SUBACCOUNT", alias = "SUB_ACCOUNT")]
    SubAccount,
}

impl ScopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agency => "AGENCY",
            Self::SubAccount => "SUBACCOUNT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "AGENCY" => Some(Self::Agency),
            "SUBACCOUNT" | "SUB_ACCOUNT" => Some(Self::SubAccount),
            _ => None,
        }
    }
}

/// The tenant a record belongs to: a whole agency, or one of its sub-accounts.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub kind: ScopeKind,
    pub agency_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_account_id: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScopeError {
    #[error("agency id is required")]
    MissingAgencyId,
    #[error("sub-account scope requires a sub-account id")]
    MissingSubAccountId,
    #[error("agency scope must not carry a sub-account id")]
    UnexpectedSubAccountId,
    #[error("feature key is required")]
    MissingFeatureKey,
    #[error("{field} contains a reserved character")]
    ReservedCharacter { field: &'static str },
}

impl Scope {
    pub fn agency(agency_id: impl Into<String>) -> Self {
        Self {
            kind: ScopeKind::Agency,
            agency_id: agency_id.into(),
            sub_account_id: None,
        }
    }

    pub fn sub_account(agency_id: impl Into<String>, sub_account_id: impl Into<String>) -> Self {
        Self {
            kind: ScopeKind::SubAccount,
            agency_id: agency_id.into(),
            sub_account_id: Some(sub_account_id.into()),
        }
    }

    pub fn feature(&self, feature_key: impl Into<String>) -> ScopeKey {
        ScopeKey {
            scope: self.clone(),
            feature_key: feature_key.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ScopeError> {
        if self.agency_id.trim().is_empty() {
            return Err(ScopeError::MissingAgencyId);
        }
        check_reserved("agency id", &self.agency_id)?;

        let sub_account = self
            .sub_account_id
            .as_deref()
            .filter(|id| !id.trim().is_empty());
        match (self.kind, sub_account) {
            (ScopeKind::Agency, None) => Ok(()),
            (ScopeKind::Agency, Some(_)) => Err(ScopeError::UnexpectedSubAccountId),
            (ScopeKind::SubAccount, None) => Err(ScopeError::MissingSubAccountId),
            (ScopeKind::SubAccount, Some(id)) => check_reserved("sub-account id", id),
        }
    }

    /// Column value for the sub-account id. Agency scopes always store the
    /// empty string, never NULL, so uniqueness constraints see one value.
    pub fn sub_account_column(&self) -> &str {
        match self.kind {
            ScopeKind::Agency => "",
            ScopeKind::SubAccount => self.sub_account_id.as_deref().unwrap_or(""),
        }
    }

    /// Same scope with the sub-account sentinel applied, so equal scopes
    /// compare and hash equal.
    pub fn canonical(&self) -> Self {
        Self::from_columns(
            self.kind,
            self.agency_id.clone(),
            self.sub_account_column().to_string(),
        )
    }

    pub fn from_columns(kind: ScopeKind, agency_id: String, sub_account_id: String) -> Self {
        let sub_account_id = match kind {
            ScopeKind::Agency => None,
            ScopeKind::SubAccount => Some(sub_account_id),
        };
        Self {
            kind,
            agency_id,
            sub_account_id,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.kind.as_str(),
            self.agency_id,
            self.sub_account_column()
        )
    }
}

/// A scope narrowed to one billable feature; the unit every ledger row is keyed by.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
    pub scope: Scope,
    pub feature_key: String,
}

impl ScopeKey {
    pub fn validate(&self) -> Result<(), ScopeError> {
        self.scope.validate()?;
        validate_feature_key(&self.feature_key)
    }

    pub fn canonical(&self) -> Self {
        Self {
            scope: self.scope.canonical(),
            feature_key: self.feature_key.clone(),
        }
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.scope, self.feature_key)
    }
}

/// Feature keys must be non-empty and must not contain `|`.
pub fn validate_feature_key(feature_key: &str) -> Result<(), ScopeError> {
    if feature_key.trim().is_empty() {
        return Err(ScopeError::MissingFeatureKey);
    }
    check_reserved("feature key", feature_key)
}

// `|` separates the components of derived idempotency keys.
fn check_reserved(field: &'static str, value: &str) -> Result<(), ScopeError> {
    if value.contains('|') {
        return Err(ScopeError::ReservedCharacter { field });
    }
    Ok(())
}
