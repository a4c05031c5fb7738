//! Duplicate order prevention.
//!
//! Two independent paths, both consulted before any (re)submission:
//!
//! 1. The idempotency-key path ([`DuplicateOrderPrevention::check_for_duplicate`])
//!    blocks a second submission while the first is in flight and returns
//!    the completed order once it is done.
//! 2. The order-identity path ([`DuplicateOrderPrevention::should_retry_order`])
//!    asks the exchange whether the order already exists. Any existing order,
//!    live or terminal, forbids a retry. When the exchange cannot be asked,
//!    the answer is also "do not retry".

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tg_core::types::{ExchangeId, OrderId, TenantId};

use crate::error::OmsResult;
use crate::exchange::{AdapterRegistry, ExchangeOrderStatus, OrderLookup};
use crate::idempotency::{IdempotencyRecord, IdempotencyRecords, IdempotencyStatus, NewIdempotencyRecord};
use crate::ledger::{OrderLedger, OrderRecord};

pub const REASON_IN_PROGRESS: &str = "Order submission in progress";
pub const REASON_COMPLETED: &str = "Order already submitted";
pub const REASON_CAN_SUBMIT: &str = "Order can be submitted";

/// Result of the idempotency-key check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    pub reason: Option<String>,
    pub record: Option<IdempotencyRecord>,
    /// The order a COMPLETED key resolved to.
    pub existing_order: Option<OrderRecord>,
}

impl DuplicateCheck {
    fn clear() -> Self {
        Self {
            is_duplicate: false,
            reason: None,
            record: None,
            existing_order: None,
        }
    }
}

/// Identifies an order whose submission may be retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRequest {
    pub order_id: Option<OrderId>,
    pub idempotency_key: Option<String>,
    pub exchange_id: ExchangeId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub reason: String,
    pub existing_order: Option<OrderRecord>,
    /// What the exchange said, when it could be asked.
    pub exchange_status: Option<ExchangeOrderStatus>,
}

impl RetryDecision {
    fn forbid(reason: String, existing: Option<OrderRecord>, status: Option<ExchangeOrderStatus>) -> Self {
        Self {
            should_retry: false,
            reason,
            existing_order: existing,
            exchange_status: status,
        }
    }
}

pub struct DuplicateOrderPrevention {
    records: IdempotencyRecords,
    ledger: Arc<OrderLedger>,
    registry: Arc<AdapterRegistry>,
    exchange_timeout: Duration,
}

impl DuplicateOrderPrevention {
    pub fn new(
        records: IdempotencyRecords,
        ledger: Arc<OrderLedger>,
        registry: Arc<AdapterRegistry>,
        exchange_timeout: Duration,
    ) -> Self {
        Self {
            records,
            ledger,
            registry,
            exchange_timeout,
        }
    }

    pub fn ledger(&self) -> &Arc<OrderLedger> {
        &self.ledger
    }

    pub fn records(&self) -> &IdempotencyRecords {
        &self.records
    }

    /// Idempotency-key path. Expired records count as absent; FAILED
    /// records do not block.
    pub fn check_for_duplicate(&self, tenant: &TenantId, key: &str) -> OmsResult<DuplicateCheck> {
        let Some(record) = self.records.get_live(tenant, key)? else {
            return Ok(DuplicateCheck::clear());
        };
        match record.status {
            s if s.in_progress() => Ok(DuplicateCheck {
                is_duplicate: true,
                reason: Some(REASON_IN_PROGRESS.to_string()),
                record: Some(record),
                existing_order: None,
            }),
            IdempotencyStatus::Completed => {
                let order = self.ledger.get(tenant, &record.order_id)?;
                Ok(DuplicateCheck {
                    is_duplicate: true,
                    reason: Some(REASON_COMPLETED.to_string()),
                    record: Some(record),
                    existing_order: order,
                })
            }
            _ => Ok(DuplicateCheck {
                record: Some(record),
                ..DuplicateCheck::clear()
            }),
        }
    }

    /// Order-identity path. Only the confirmed absence of the order, both
    /// locally and on the exchange, permits a retry.
    pub async fn should_retry_order(&self, tenant: &TenantId, req: &RetryRequest) -> OmsResult<RetryDecision> {
        let local = self
            .ledger
            .find(tenant, req.order_id.as_ref(), req.idempotency_key.as_deref())?;

        let lookup = match (&local, &req.order_id) {
            (Some(o), _) => match &o.exchange_order_id {
                Some(xid) => OrderLookup::Exchange(xid.clone()),
                None => OrderLookup::Client(o.order_id.clone()),
            },
            (None, Some(id)) => OrderLookup::Client(id.clone()),
            (None, None) => {
                // Nothing to look up on the exchange; the key alone decides.
                return Ok(RetryDecision {
                    should_retry: true,
                    reason: REASON_CAN_SUBMIT.to_string(),
                    existing_order: None,
                    exchange_status: None,
                });
            }
        };

        let status = match self.query_status(tenant, &req.exchange_id, &lookup).await {
            Ok(s) => s,
            Err(reason) => {
                tracing::warn!(
                    tenant_id = %tenant,
                    exchange_id = %req.exchange_id,
                    lookup = ?lookup,
                    reason = %reason,
                    "cannot verify order on exchange, not retrying"
                );
                return Ok(RetryDecision::forbid(
                    format!("Cannot verify order status: {}", reason),
                    local,
                    None,
                ));
            }
        };

        if let Some(order) = local {
            return Ok(RetryDecision::forbid(
                format!("Order {} already exists ({:?})", order.order_id, status),
                Some(order),
                Some(status),
            ));
        }
        if status.exists() {
            return Ok(RetryDecision::forbid(
                format!("Order already exists on exchange ({:?})", status),
                None,
                Some(status),
            ));
        }
        Ok(RetryDecision {
            should_retry: true,
            reason: REASON_CAN_SUBMIT.to_string(),
            existing_order: None,
            exchange_status: Some(status),
        })
    }

    async fn query_status(
        &self,
        tenant: &TenantId,
        exchange: &ExchangeId,
        lookup: &OrderLookup,
    ) -> Result<ExchangeOrderStatus, String> {
        let adapter = self.registry.get(tenant, exchange).map_err(|e| e.to_string())?;
        match tokio::time::timeout(self.exchange_timeout, adapter.get_order_status(lookup)).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!("timed out after {:?}", self.exchange_timeout)),
        }
    }

    pub fn create_idempotency_record(
        &self,
        tenant: &TenantId,
        req: &NewIdempotencyRecord,
    ) -> OmsResult<IdempotencyRecord> {
        self.records.create(tenant, req)
    }

    pub fn update_idempotency_record(
        &self,
        tenant: &TenantId,
        key: &str,
        status: IdempotencyStatus,
    ) -> OmsResult<IdempotencyRecord> {
        self.records.update(tenant, key, status, None)
    }

    pub fn remove_idempotency_record(&self, tenant: &TenantId, key: &str) -> OmsResult<bool> {
        self.records.remove(tenant, key)
    }

    pub fn prune_expired(&self) -> OmsResult<usize> {
        self.records.prune_expired()
    }
}
