use thiserror::Error;

use crate::config::ConfigError;
use crate::entitlement::ResolverError;
use crate::period::PeriodError;
use crate::scope::ScopeError;
use crate::store::StoreError;

/// Infrastructure failures. Plan, quota and credit outcomes are never
/// reported through this type; retrying with the same idempotency key is safe.
#[derive(Debug, Error)]
pub enum MeteringError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("entitlement resolver error: {0}")]
    Resolver(#[from] ResolverError),
    #[error("period error: {0}")]
    Period(#[from] PeriodError),
    #[error("invalid scope: {0}")]
    Scope(#[from] ScopeError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

pub type Result<T> = std::result::Result<T, MeteringError>;
