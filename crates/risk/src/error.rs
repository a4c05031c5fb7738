//! Error taxonomy for risk control operations.
//!
//! Precondition failures are always surfaced to the caller as typed errors.
//! Blocked trading actions are not errors; they are reported through
//! [`RiskReject`](crate::pipeline::RiskReject).

use tg_core::store::StoreError;
use tg_core::types::BreakerId;

use crate::circuit_breaker::BreakerState;

/// Circuit breaker state-machine failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CircuitBreakerError {
    /// The requested edge does not exist in the breaker state machine.
    #[error("invalid transition for breaker {breaker_id}: {from} -> {to}")]
    InvalidTransition {
        breaker_id: BreakerId,
        from: BreakerState,
        to: BreakerState,
    },
    /// No breaker with this id exists for the tenant.
    #[error("circuit breaker not found: {0}")]
    NotFound(BreakerId),
}

/// Errors returned by risk control services.
#[derive(Debug, thiserror::Error)]
pub enum RiskError {
    /// A privileged operation was attempted without a usable token.
    #[error("authentication required: {0}")]
    AuthenticationRequired(String),
    /// Invalid breaker transition or unknown breaker.
    #[error(transparent)]
    CircuitBreaker(#[from] CircuitBreakerError),
    /// Unknown entity (drawdown state, kill switch, config, ...).
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    /// Rejected input (threshold ordering, non-finite values, ...).
    #[error("validation failed: {0}")]
    Validation(String),
    /// Optimistic concurrency gave up on an entity under heavy contention.
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),
    /// Storage failure.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for RiskError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { .. } | StoreError::Contention { .. } => {
                RiskError::ConcurrentModification(err.to_string())
            }
            other => RiskError::Store(other),
        }
    }
}

impl RiskError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        RiskError::Validation(msg.into())
    }
}

/// Convenience alias.
pub type RiskResult<T> = Result<T, RiskError>;
