//! Exchange adapter seam and per-tenant registry.
//!
//! The [`ExchangeAdapter`] trait is the only place order traffic crosses
//! the network. Wire protocols live in implementations; the OMS sees order
//! placement, cancellation and status lookups. Adapters are registered per
//! (tenant, exchange) in an [`AdapterRegistry`] that is passed explicitly to
//! whoever needs it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use tg_core::types::{AssetId, ExchangeId, ExchangeOrderId, OrderId, TenantId};

use crate::error::{OmsError, OmsResult};

/// Order status as the exchange reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeOrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
    /// The exchange has no order under the requested id.
    NotFound,
}

impl ExchangeOrderStatus {
    /// The exchange knows this order, in any state.
    pub fn exists(self) -> bool {
        self != ExchangeOrderStatus::NotFound
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExchangeOrderStatus::Filled
                | ExchangeOrderStatus::Cancelled
                | ExchangeOrderStatus::Rejected
                | ExchangeOrderStatus::Expired
        )
    }
}

/// How to find an order on the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderLookup {
    /// Client-assigned id.
    Client(OrderId),
    /// Exchange-assigned id.
    Exchange(ExchangeOrderId),
}

/// A new order to place.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    /// Client order id; the exchange echoes it and can be queried by it.
    pub order_id: OrderId,
    pub asset_id: AssetId,
    pub quantity: f64,
}

/// Acknowledgment returned after a successful placement.
#[derive(Debug, Clone)]
pub struct PlaceAck {
    pub exchange_order_id: ExchangeOrderId,
    pub status: ExchangeOrderStatus,
}

/// Unified trait for exchange order operations.
///
/// Implementors handle signing, serialization and error mapping. Every call
/// may fail or hang; callers bound them with a timeout.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn get_order_status(&self, lookup: &OrderLookup) -> Result<ExchangeOrderStatus>;

    async fn place_order(&self, order: &PlaceOrder) -> Result<PlaceAck>;

    async fn cancel_order(&self, lookup: &OrderLookup) -> Result<()>;
}

/// Adapters keyed by (tenant, exchange).
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: DashMap<(TenantId, ExchangeId), Arc<dyn ExchangeAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the adapter for `tenant` on `exchange`.
    pub fn register(&self, tenant: &TenantId, exchange: &ExchangeId, adapter: Arc<dyn ExchangeAdapter>) {
        tracing::info!(tenant_id = %tenant, exchange_id = %exchange, "exchange adapter registered");
        self.adapters.insert((tenant.clone(), exchange.clone()), adapter);
    }

    pub fn get(&self, tenant: &TenantId, exchange: &ExchangeId) -> OmsResult<Arc<dyn ExchangeAdapter>> {
        self.adapters
            .get(&(tenant.clone(), exchange.clone()))
            .map(|a| a.value().clone())
            .ok_or_else(|| OmsError::AdapterNotRegistered {
                tenant_id: tenant.clone(),
                exchange_id: exchange.clone(),
            })
    }

    pub fn remove(&self, tenant: &TenantId, exchange: &ExchangeId) -> bool {
        self.adapters.remove(&(tenant.clone(), exchange.clone())).is_some()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// In-process exchange that accepts every order. Used for paper trading
/// and as a test double; failures can be scripted.
#[derive(Default)]
pub struct PaperExchange {
    orders: DashMap<OrderId, (ExchangeOrderId, ExchangeOrderStatus)>,
    seq: AtomicU64,
    fail_next_places: AtomicU64,
    /// Accept the order but report failure to the caller (lost ack).
    drop_next_acks: AtomicU64,
    fail_status: AtomicU64,
    place_calls: AtomicU64,
    fill_on_place: AtomicBool,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` placements fail without reaching the book.
    pub fn fail_next_places(&self, n: u64) {
        self.fail_next_places.store(n, Ordering::SeqCst);
    }

    /// The next `n` placements reach the book but the ack is lost.
    pub fn drop_next_acks(&self, n: u64) {
        self.drop_next_acks.store(n, Ordering::SeqCst);
    }

    /// New placements fill immediately instead of resting.
    pub fn fill_on_place(&self, fill: bool) {
        self.fill_on_place.store(fill, Ordering::SeqCst);
    }

    /// The next `n` status lookups fail.
    pub fn fail_status_lookups(&self, n: u64) {
        self.fail_status.store(n, Ordering::SeqCst);
    }

    pub fn place_calls(&self) -> u64 {
        self.place_calls.load(Ordering::SeqCst)
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    /// Force a resting order into `status`.
    pub fn set_status(&self, order_id: &OrderId, status: ExchangeOrderStatus) {
        if let Some(mut entry) = self.orders.get_mut(order_id) {
            entry.1 = status;
        }
    }

    fn take(counter: &AtomicU64) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn find(&self, lookup: &OrderLookup) -> Option<(OrderId, ExchangeOrderStatus)> {
        match lookup {
            OrderLookup::Client(id) => self.orders.get(id).map(|e| (id.clone(), e.1)),
            OrderLookup::Exchange(xid) => self
                .orders
                .iter()
                .find(|e| &e.value().0 == xid)
                .map(|e| (e.key().clone(), e.value().1)),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    async fn get_order_status(&self, lookup: &OrderLookup) -> Result<ExchangeOrderStatus> {
        if Self::take(&self.fail_status) {
            anyhow::bail!("status endpoint unavailable");
        }
        Ok(self
            .find(lookup)
            .map(|(_, s)| s)
            .unwrap_or(ExchangeOrderStatus::NotFound))
    }

    async fn place_order(&self, order: &PlaceOrder) -> Result<PlaceAck> {
        self.place_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.fail_next_places) {
            anyhow::bail!("order {} rejected by gateway: connection reset", order.order_id);
        }
        if order.quantity <= 0.0 || !order.quantity.is_finite() {
            anyhow::bail!("invalid quantity {}", order.quantity);
        }
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let xid = ExchangeOrderId::new(format!("PX-{:06}", n));
        let status = if self.fill_on_place.load(Ordering::SeqCst) {
            ExchangeOrderStatus::Filled
        } else {
            ExchangeOrderStatus::New
        };
        self.orders.insert(order.order_id.clone(), (xid.clone(), status));
        if Self::take(&self.drop_next_acks) {
            anyhow::bail!("timed out waiting for ack of {}", order.order_id);
        }
        Ok(PlaceAck {
            exchange_order_id: xid,
            status,
        })
    }

    async fn cancel_order(&self, lookup: &OrderLookup) -> Result<()> {
        let Some((id, status)) = self.find(lookup) else {
            anyhow::bail!("unknown order {:?}", lookup);
        };
        if status.is_terminal() {
            anyhow::bail!("order {} already {:?}", id, status);
        }
        self.set_status(&id, ExchangeOrderStatus::Cancelled);
        Ok(())
    }
}
