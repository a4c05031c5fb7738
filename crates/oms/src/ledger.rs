//! Order ledger: every order the exchange has acknowledged.
//!
//! Orders land here once placement succeeds (or once a lost ack is
//! recovered from the exchange). The ledger is what duplicate prevention
//! consults first and what the kill switch sweeps when cancelling.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tg_core::store::{update_versioned, Change, InMemoryRepository, Repository, StoreError, Versioned};
use tg_core::types::{AssetId, Clock, ExchangeId, ExchangeOrderId, OrderId, StrategyId, TenantId};

use crate::error::{OmsError, OmsResult};
use crate::exchange::ExchangeOrderStatus;

/// Local view of an order's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Resting on the book.
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Returns `true` if this status is terminal (no further transitions).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }

    /// Local status for what the exchange reports. `None` for NOT_FOUND.
    pub fn from_exchange(status: ExchangeOrderStatus) -> Option<Self> {
        Some(match status {
            ExchangeOrderStatus::New => Self::Open,
            ExchangeOrderStatus::PartiallyFilled => Self::PartiallyFilled,
            ExchangeOrderStatus::Filled => Self::Filled,
            ExchangeOrderStatus::Cancelled | ExchangeOrderStatus::Expired => Self::Cancelled,
            ExchangeOrderStatus::Rejected => Self::Rejected,
            ExchangeOrderStatus::NotFound => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: OrderId,
    pub tenant_id: TenantId,
    pub idempotency_key: Option<String>,
    pub exchange_id: ExchangeId,
    pub exchange_order_id: Option<ExchangeOrderId>,
    pub strategy_id: Option<StrategyId>,
    pub asset_id: AssetId,
    pub quantity: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Versioned for OrderRecord {
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

pub struct OrderLedger {
    orders: Arc<dyn Repository<OrderRecord>>,
    clock: Arc<dyn Clock>,
}

impl OrderLedger {
    pub fn new(orders: Arc<dyn Repository<OrderRecord>>, clock: Arc<dyn Clock>) -> Self {
        Self { orders, clock }
    }

    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(Arc::new(InMemoryRepository::new()), clock)
    }

    /// Record an order. An existing record under the same id is returned
    /// unchanged.
    pub fn record(&self, order: OrderRecord) -> OmsResult<OrderRecord> {
        let tenant = order.tenant_id.clone();
        let id = order.order_id.clone();
        match self.orders.insert_if_absent(&tenant, id.as_str(), order.clone())? {
            Some(existing) => Ok(existing),
            None => {
                tracing::debug!(tenant_id = %tenant, order_id = %id, "order recorded");
                Ok(self.orders.get(&tenant, id.as_str())?.unwrap_or(order))
            }
        }
    }

    pub fn get(&self, tenant: &TenantId, order_id: &OrderId) -> OmsResult<Option<OrderRecord>> {
        Ok(self.orders.get(tenant, order_id.as_str())?)
    }

    pub fn find_by_key(&self, tenant: &TenantId, key: &str) -> OmsResult<Option<OrderRecord>> {
        Ok(self
            .orders
            .list_where(tenant, &|o| o.idempotency_key.as_deref() == Some(key))?
            .into_iter()
            .next())
    }

    /// Order matching `order_id` or, failing that, `idempotency_key`.
    pub fn find(
        &self,
        tenant: &TenantId,
        order_id: Option<&OrderId>,
        idempotency_key: Option<&str>,
    ) -> OmsResult<Option<OrderRecord>> {
        if let Some(id) = order_id {
            if let Some(found) = self.get(tenant, id)? {
                return Ok(Some(found));
            }
        }
        match idempotency_key {
            Some(key) => self.find_by_key(tenant, key),
            None => Ok(None),
        }
    }

    pub fn set_status(
        &self,
        tenant: &TenantId,
        order_id: &OrderId,
        status: OrderStatus,
    ) -> OmsResult<OrderRecord> {
        let now = self.clock.now();
        let (stored, ()) = update_versioned(self.orders.as_ref(), tenant, order_id.as_str(), |o| {
            if o.status == status {
                return Ok::<_, OmsError>(Change::Keep(()));
            }
            o.status = status;
            o.updated_at = now;
            Ok(Change::Write(()))
        })
        .map_err(|e| match e {
            OmsError::Store(StoreError::NotFound(id)) => OmsError::NotFound { entity: "order", id },
            other => other,
        })?;
        Ok(stored)
    }

    /// Non-terminal orders of `tenant` accepted by `filter`.
    pub fn working_orders(
        &self,
        tenant: &TenantId,
        filter: &dyn Fn(&OrderRecord) -> bool,
    ) -> OmsResult<Vec<OrderRecord>> {
        let mut orders = self
            .orders
            .list_where(tenant, &|o| !o.status.is_terminal() && filter(o))?;
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(orders)
    }
}
