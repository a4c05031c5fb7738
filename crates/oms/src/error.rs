//! Errors for order submission, idempotency and backfill flows.

use tg_core::store::StoreError;
use tg_core::types::{ExchangeId, TenantId};
use tg_risk::RiskReject;

#[derive(Debug, thiserror::Error)]
pub enum OmsError {
    /// The submission was blocked; carries the machine-readable reason.
    #[error(transparent)]
    Rejected(#[from] RiskReject),
    #[error("invalid backfill request: {0}")]
    InvalidBackfillRequest(String),
    #[error("backfill {request_id} already in progress for {asset_id} from {source_name}")]
    BackfillAlreadyInProgress {
        request_id: String,
        asset_id: String,
        source_name: String,
    },
    #[error("backfill {request_id} cannot be cancelled in state {status}")]
    BackfillCannotBeCancelled { request_id: String, status: String },
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("no exchange adapter registered for tenant {tenant_id} on {exchange_id}")]
    AdapterNotRegistered {
        tenant_id: TenantId,
        exchange_id: ExchangeId,
    },
    #[error("rate limit exceeded for {source_name}: {current}/{limit} in window")]
    RateLimited {
        source_name: String,
        current: usize,
        limit: usize,
    },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OmsError {
    /// Machine-readable reason, shared with the risk gate's codes where the
    /// cases overlap.
    pub fn code(&self) -> &'static str {
        match self {
            OmsError::Rejected(r) => r.code(),
            OmsError::InvalidBackfillRequest(_) => "invalid_backfill_request",
            OmsError::BackfillAlreadyInProgress { .. } => "backfill_already_in_progress",
            OmsError::BackfillCannotBeCancelled { .. } => "backfill_cannot_be_cancelled",
            OmsError::NotFound { .. } => "not_found",
            OmsError::AdapterNotRegistered { .. } => "adapter_not_registered",
            OmsError::RateLimited { .. } => "rate_limited",
            OmsError::Validation(_) => "validation_failed",
            OmsError::Store(_) => "storage_error",
        }
    }
}

pub type OmsResult<T> = Result<T, OmsError>;
