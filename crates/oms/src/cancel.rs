//! Pending-order cancellation for kill switch activation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tg_core::types::TenantId;
use tg_risk::kill_switch::{CancellationReport, KillSwitchScope, PendingOrderCanceller};

use crate::exchange::{AdapterRegistry, OrderLookup};
use crate::ledger::{OrderLedger, OrderRecord, OrderStatus};

/// Cancels the working orders in the ledger that fall under a kill
/// switch scope. Each cancel is time-bounded; failures are counted, not
/// retried.
pub struct LedgerCanceller {
    ledger: Arc<OrderLedger>,
    registry: Arc<AdapterRegistry>,
    timeout: Duration,
}

impl LedgerCanceller {
    pub fn new(ledger: Arc<OrderLedger>, registry: Arc<AdapterRegistry>, timeout: Duration) -> Self {
        Self {
            ledger,
            registry,
            timeout,
        }
    }

    async fn cancel_one(&self, tenant: &TenantId, order: &OrderRecord) -> Result<(), String> {
        let adapter = self
            .registry
            .get(tenant, &order.exchange_id)
            .map_err(|e| e.to_string())?;
        let lookup = match &order.exchange_order_id {
            Some(xid) => OrderLookup::Exchange(xid.clone()),
            None => OrderLookup::Client(order.order_id.clone()),
        };
        match tokio::time::timeout(self.timeout, adapter.cancel_order(&lookup)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(format!("{:#}", e)),
            Err(_) => return Err(format!("timed out after {:?}", self.timeout)),
        }
        self.ledger
            .set_status(tenant, &order.order_id, OrderStatus::Cancelled)
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

fn in_scope(order: &OrderRecord, scope: &KillSwitchScope) -> bool {
    match scope {
        KillSwitchScope::Tenant => true,
        KillSwitchScope::Strategy(id) => order.strategy_id.as_ref() == Some(id),
        KillSwitchScope::Asset(id) => &order.asset_id == id,
    }
}

fn saturating_count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[async_trait]
impl PendingOrderCanceller for LedgerCanceller {
    async fn cancel_pending(&self, tenant: &TenantId, scope: &KillSwitchScope) -> CancellationReport {
        let orders = match self.ledger.working_orders(tenant, &|o| in_scope(o, scope)) {
            Ok(orders) => orders,
            Err(e) => {
                tracing::error!(tenant_id = %tenant, scope = %scope, error = %e, "cannot list pending orders");
                return CancellationReport::default();
            }
        };

        let mut report = CancellationReport {
            attempted: saturating_count(orders.len()),
            ..Default::default()
        };
        for order in &orders {
            match self.cancel_one(tenant, order).await {
                Ok(()) => report.cancelled = report.cancelled.saturating_add(1),
                Err(error) => {
                    report.failed = report.failed.saturating_add(1);
                    tracing::warn!(
                        tenant_id = %tenant,
                        order_id = %order.order_id,
                        error = %error,
                        "pending order cancel failed"
                    );
                }
            }
        }
        tracing::info!(
            tenant_id = %tenant,
            scope = %scope,
            attempted = report.attempted,
            cancelled = report.cancelled,
            failed = report.failed,
            "pending orders swept"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tg_core::types::{AssetId, Clock, ExchangeId, ManualClock, OrderId, StrategyId};

    use crate::exchange::{ExchangeAdapter, PaperExchange, PlaceOrder};

    struct Fixture {
        canceller: LedgerCanceller,
        ledger: Arc<OrderLedger>,
        exchange: Arc<PaperExchange>,
    }

    fn make_fixture() -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let ledger = Arc::new(OrderLedger::in_memory(clock));
        let registry = Arc::new(AdapterRegistry::new());
        let exchange = Arc::new(PaperExchange::new());
        registry.register(&TenantId::new("acme"), &ExchangeId::new("paper"), exchange.clone());
        Fixture {
            canceller: LedgerCanceller::new(ledger.clone(), registry, Duration::from_millis(200)),
            ledger,
            exchange,
        }
    }

    async fn place(f: &Fixture, id: &str, asset: &str, strategy: &str, exchange: &str) {
        let ack = f
            .exchange
            .place_order(&PlaceOrder {
                order_id: OrderId::new(id),
                asset_id: AssetId::new(asset),
                quantity: 1.0,
            })
            .await
            .unwrap();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        f.ledger
            .record(OrderRecord {
                order_id: OrderId::new(id),
                tenant_id: TenantId::new("acme"),
                idempotency_key: Some(format!("k-{}", id)),
                exchange_id: ExchangeId::new(exchange),
                exchange_order_id: Some(ack.exchange_order_id),
                strategy_id: Some(StrategyId::new(strategy)),
                asset_id: AssetId::new(asset),
                quantity: 1.0,
                status: OrderStatus::Open,
                created_at: at,
                updated_at: at,
                version: 0,
            })
            .unwrap();
    }

    #[test]
    fn test_order_count_saturates() {
        assert_eq!(saturating_count(0), 0);
        assert_eq!(saturating_count(3), 3);
        assert_eq!(saturating_count(usize::MAX), u32::MAX);
    }

    #[tokio::test]
    async fn test_tenant_scope_cancels_everything() {
        let f = make_fixture();
        place(&f, "o-1", "BTC-USD", "mm-1", "paper").await;
        place(&f, "o-2", "ETH-USD", "mm-2", "paper").await;

        let report = f
            .canceller
            .cancel_pending(&TenantId::new("acme"), &KillSwitchScope::Tenant)
            .await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.cancelled, 2);
        assert_eq!(report.failed, 0);
        assert!(f
            .ledger
            .working_orders(&TenantId::new("acme"), &|_| true)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_narrow_scopes() {
        let f = make_fixture();
        place(&f, "o-1", "BTC-USD", "mm-1", "paper").await;
        place(&f, "o-2", "ETH-USD", "mm-2", "paper").await;
        let tenant = TenantId::new("acme");

        let report = f
            .canceller
            .cancel_pending(&tenant, &KillSwitchScope::Asset(AssetId::new("ETH-USD")))
            .await;
        assert_eq!(report.cancelled, 1);

        let report = f
            .canceller
            .cancel_pending(&tenant, &KillSwitchScope::Strategy(StrategyId::new("mm-1")))
            .await;
        assert_eq!(report.cancelled, 1);
    }

    #[tokio::test]
    async fn test_partial_failure_is_reported() {
        let f = make_fixture();
        place(&f, "o-1", "BTC-USD", "mm-1", "paper").await;
        // Routed to an exchange with no adapter: cancel fails.
        place(&f, "o-2", "BTC-USD", "mm-1", "ghost").await;

        let report = f
            .canceller
            .cancel_pending(&TenantId::new("acme"), &KillSwitchScope::Tenant)
            .await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.failed, 1);
        let left = f
            .ledger
            .working_orders(&TenantId::new("acme"), &|_| true)
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].order_id, OrderId::new("o-2"));
    }
}
