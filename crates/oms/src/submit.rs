//! Exchange submission with duplicate protection and bounded retries.
//!
//! [`OrderSubmitter::submit`] runs after the risk gate approved an order:
//!
//! 1. idempotency-key check, then an atomic claim on the key
//! 2. place the order with a timeout
//! 3. on failure ask [`DuplicateOrderPrevention::should_retry_order`]; an
//!    order that turns out to exist is adopted instead of resubmitted
//! 4. give up after `max_attempts` with `retries_exhausted`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tg_core::types::{AssetId, Clock, ExchangeId, ExchangeOrderId, OrderId, StrategyId, TenantId};
use tg_risk::RiskReject;

use crate::duplicate::{DuplicateOrderPrevention, RetryRequest};
use crate::error::{OmsError, OmsResult};
use crate::exchange::{AdapterRegistry, ExchangeOrderStatus, PlaceOrder};
use crate::idempotency::{Claim, IdempotencyStatus, NewIdempotencyRecord};
use crate::ledger::{OrderLedger, OrderRecord, OrderStatus};
use crate::rate_limit::SlidingWindowLimiter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Client order id; generated when absent.
    #[serde(default)]
    pub order_id: Option<OrderId>,
    pub idempotency_key: String,
    pub exchange_id: ExchangeId,
    pub asset_id: AssetId,
    #[serde(default)]
    pub strategy_id: Option<StrategyId>,
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitReceipt {
    pub order: OrderRecord,
    pub attempts: u32,
    /// The ack was lost but the exchange had the order.
    pub recovered: bool,
}

pub struct OrderSubmitter {
    prevention: Arc<DuplicateOrderPrevention>,
    registry: Arc<AdapterRegistry>,
    limiter: Option<Arc<SlidingWindowLimiter>>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    exchange_timeout: Duration,
    retry_backoff: Duration,
    seq: AtomicU64,
}

impl OrderSubmitter {
    pub fn new(
        prevention: Arc<DuplicateOrderPrevention>,
        registry: Arc<AdapterRegistry>,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
        exchange_timeout: Duration,
    ) -> Self {
        Self {
            prevention,
            registry,
            limiter: None,
            clock,
            max_attempts: max_attempts.max(1),
            exchange_timeout,
            retry_backoff: Duration::ZERO,
            seq: AtomicU64::new(0),
        }
    }

    /// Rate-limit placements per exchange.
    pub fn with_rate_limiter(mut self, limiter: Arc<SlidingWindowLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Pause `backoff * attempt` between attempts.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    fn ledger(&self) -> &Arc<OrderLedger> {
        self.prevention.ledger()
    }

    /// Next client order id, `ord-{millis}-{seq:06}`.
    pub fn next_order_id(&self) -> OrderId {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        OrderId::new(format!("ord-{}-{:06}", self.clock.now().timestamp_millis(), n))
    }

    pub async fn submit(&self, tenant: &TenantId, req: SubmitRequest) -> OmsResult<SubmitReceipt> {
        if !req.quantity.is_finite() || req.quantity <= 0.0 {
            return Err(RiskReject::InvalidOrder(format!("quantity must be positive, got {}", req.quantity)).into());
        }
        let key = req.idempotency_key.as_str();

        let check = self.prevention.check_for_duplicate(tenant, key)?;
        if check.is_duplicate {
            return Err(RiskReject::DuplicateDetected {
                reason: check.reason.unwrap_or_else(|| "duplicate idempotency key".into()),
            }
            .into());
        }
        let order_id = req.order_id.clone().unwrap_or_else(|| self.next_order_id());
        if let Some(existing) = self.ledger().get(tenant, &order_id)? {
            return Err(RiskReject::DuplicateDetected {
                reason: format!("order {} already exists ({:?})", existing.order_id, existing.status),
            }
            .into());
        }
        let adapter = self.registry.get(tenant, &req.exchange_id)?;
        if let Some(limiter) = &self.limiter {
            limiter.try_acquire(req.exchange_id.as_str())?;
        }

        let claim = self.prevention.records().claim(
            tenant,
            &NewIdempotencyRecord {
                idempotency_key: key.to_string(),
                order_id: order_id.clone(),
                exchange_id: req.exchange_id.clone(),
                ttl_secs: None,
            },
        )?;
        if let Claim::Held(held) = claim {
            return Err(RiskReject::DuplicateDetected {
                reason: format!(
                    "{} (order {})",
                    crate::duplicate::REASON_IN_PROGRESS,
                    held.order_id
                ),
            }
            .into());
        }

        let place = PlaceOrder {
            order_id: order_id.clone(),
            asset_id: req.asset_id.clone(),
            quantity: req.quantity,
        };
        let retry = RetryRequest {
            order_id: Some(order_id.clone()),
            idempotency_key: Some(key.to_string()),
            exchange_id: req.exchange_id.clone(),
        };

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            self.prevention
                .records()
                .update(tenant, key, IdempotencyStatus::Submitted, None)?;

            let outcome = tokio::time::timeout(self.exchange_timeout, adapter.place_order(&place)).await;
            match outcome {
                Ok(Ok(ack)) => {
                    let order =
                        self.accept(tenant, &req, &order_id, Some(ack.exchange_order_id), ack.status)?;
                    tracing::info!(
                        tenant_id = %tenant,
                        order_id = %order_id,
                        exchange_id = %req.exchange_id,
                        attempt,
                        "order placed"
                    );
                    return Ok(SubmitReceipt {
                        order,
                        attempts: attempt,
                        recovered: false,
                    });
                }
                Ok(Err(e)) => last_error = format!("{:#}", e),
                Err(_) => last_error = format!("timed out after {:?}", self.exchange_timeout),
            }
            tracing::warn!(
                tenant_id = %tenant,
                order_id = %order_id,
                attempt,
                max_attempts = self.max_attempts,
                error = %last_error,
                "order placement failed"
            );

            let decision = self.prevention.should_retry_order(tenant, &retry).await?;
            if !decision.should_retry {
                if let Some(status) = decision.exchange_status.filter(|s| s.exists()) {
                    let order = self.accept(tenant, &req, &order_id, None, status)?;
                    tracing::info!(
                        tenant_id = %tenant,
                        order_id = %order_id,
                        status = ?order.status,
                        reason = %decision.reason,
                        "order found on exchange after failed placement"
                    );
                    return Ok(SubmitReceipt {
                        order,
                        attempts: attempt,
                        recovered: true,
                    });
                }
                // The exchange could not be asked. Leave the key in flight so
                // nothing resubmits it before it expires.
                tracing::error!(
                    tenant_id = %tenant,
                    order_id = %order_id,
                    reason = %decision.reason,
                    "order state unknown, not retrying"
                );
                return Err(RiskReject::RetriesExhausted {
                    attempts: attempt,
                    last_error: decision.reason,
                }
                .into());
            }
            if attempt < self.max_attempts && !self.retry_backoff.is_zero() {
                tokio::time::sleep(self.retry_backoff * attempt).await;
            }
        }

        self.prevention
            .records()
            .update(tenant, key, IdempotencyStatus::Failed, None)?;
        tracing::error!(
            tenant_id = %tenant,
            order_id = %order_id,
            attempts = self.max_attempts,
            error = %last_error,
            "order submission gave up"
        );
        Err(RiskReject::RetriesExhausted {
            attempts: self.max_attempts,
            last_error,
        }
        .into())
    }

    fn accept(
        &self,
        tenant: &TenantId,
        req: &SubmitRequest,
        order_id: &OrderId,
        exchange_order_id: Option<ExchangeOrderId>,
        exchange_status: ExchangeOrderStatus,
    ) -> OmsResult<OrderRecord> {
        let now = self.clock.now();
        let status = OrderStatus::from_exchange(exchange_status).unwrap_or(OrderStatus::Open);
        let order = self.ledger().record(OrderRecord {
            order_id: order_id.clone(),
            tenant_id: tenant.clone(),
            idempotency_key: Some(req.idempotency_key.clone()),
            exchange_id: req.exchange_id.clone(),
            exchange_order_id: exchange_order_id.clone(),
            strategy_id: req.strategy_id.clone(),
            asset_id: req.asset_id.clone(),
            quantity: req.quantity,
            status,
            created_at: now,
            updated_at: now,
            version: 0,
        })?;
        self.prevention.records().update(
            tenant,
            &req.idempotency_key,
            IdempotencyStatus::Completed,
            exchange_order_id,
        )?;
        Ok(order)
    }
}

/// Errors that only mean "this order was blocked" rather than a fault.
pub fn is_rejection(err: &OmsError) -> bool {
    matches!(err, OmsError::Rejected(_) | OmsError::RateLimited { .. })
}
