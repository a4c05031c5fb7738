//! Risk engine: builds every control from [`AppConfig`], runs the periodic
//! sweeps and hosts the HTTP server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tg_core::alert::{dispatch_alert, Alert, AlertSink};
use tg_core::config::AppConfig;
use tg_core::types::Clock;
use tg_oms::{
    AdapterRegistry, DuplicateOrderPrevention, IdempotencyRecords, LedgerCanceller, OrderLedger,
    OrderSubmitter, SlidingWindowLimiter,
};
use tg_oms::backfill::BackfillTracker;
use tg_risk::circuit_breaker::CircuitBreakerService;
use tg_risk::drawdown::{DrawdownConfig, DrawdownService};
use tg_risk::kill_switch::{KillSwitchConfig, KillSwitchService, StaticTokenVerifier, TokenVerifier};
use tg_risk::volatility::{VolatilityConfig, VolatilityService};
use tg_risk::{Approval, OrderIntent, RiskGate, RiskReject};

use crate::server;

/// Counters exported on `/metrics`.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub orders_checked: AtomicU64,
    pub orders_approved: AtomicU64,
    pub orders_rejected: AtomicU64,
    pub breakers_closed: AtomicU64,
    pub breakers_retripped: AtomicU64,
    pub idempotency_pruned: AtomicU64,
    pub backfills_expired: AtomicU64,
    pub sweep_failures: AtomicU64,
}

/// What one maintenance pass changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub half_opened: usize,
    pub closed: usize,
    pub retripped: usize,
    pub drawdown_refreshed: usize,
    pub volatility_released: usize,
    pub failures: usize,
}

/// What one prune pass removed or expired.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneReport {
    pub idempotency_pruned: usize,
    pub backfills_expired: usize,
    pub failures: usize,
}

/// Every control the service exposes, wired together.
pub struct RiskEngine {
    pub config: AppConfig,
    pub clock: Arc<dyn Clock>,
    pub alerts: Arc<dyn AlertSink>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub breakers: Arc<CircuitBreakerService>,
    pub volatility: Arc<VolatilityService>,
    pub drawdown: Arc<DrawdownService>,
    pub kill_switch: Arc<KillSwitchService>,
    pub gate: RiskGate,
    pub registry: Arc<AdapterRegistry>,
    pub ledger: Arc<OrderLedger>,
    pub prevention: Arc<DuplicateOrderPrevention>,
    pub submitter: OrderSubmitter,
    pub backfill: BackfillTracker,
    pub metrics: EngineMetrics,
}

impl RiskEngine {
    /// Build the engine over in-process repositories.
    pub fn build(config: AppConfig, clock: Arc<dyn Clock>, alerts: Arc<dyn AlertSink>) -> Result<Self> {
        config.validate()?;

        let token = config.kill_switch.operator_token.clone();
        if token.trim().is_empty() {
            tracing::warn!("no operator token configured; authenticated deactivation will be refused");
        }
        let verifier: Arc<dyn TokenVerifier> = Arc::new(StaticTokenVerifier::new([token]));

        let exchange_timeout = Duration::from_millis(config.duplicate.exchange_timeout_ms);
        let registry = Arc::new(AdapterRegistry::new());
        let ledger = Arc::new(OrderLedger::in_memory(clock.clone()));

        let breakers = Arc::new(CircuitBreakerService::in_memory(
            alerts.clone(),
            clock.clone(),
            config.circuit_breaker.clone(),
        ));
        let volatility = Arc::new(VolatilityService::in_memory(
            alerts.clone(),
            clock.clone(),
            VolatilityConfig::from(&config.volatility),
        )?);
        let drawdown = Arc::new(DrawdownService::in_memory(
            alerts.clone(),
            clock.clone(),
            DrawdownConfig::from(&config.drawdown),
        )?);
        let canceller = Arc::new(LedgerCanceller::new(
            ledger.clone(),
            registry.clone(),
            exchange_timeout,
        ));
        let kill_switch = Arc::new(KillSwitchService::in_memory(
            verifier.clone(),
            canceller,
            alerts.clone(),
            clock.clone(),
            KillSwitchConfig::from(&config.kill_switch),
        ));

        let gate = RiskGate::standard(
            kill_switch.clone(),
            breakers.clone(),
            drawdown.clone(),
            volatility.clone(),
        );

        let records = IdempotencyRecords::in_memory(
            clock.clone(),
            chrono::Duration::seconds(config.duplicate.idempotency_ttl_secs),
        );
        let prevention = Arc::new(DuplicateOrderPrevention::new(
            records,
            ledger.clone(),
            registry.clone(),
            exchange_timeout,
        ));

        let window = Duration::from_millis(config.rate_limit.window_ms);
        let submitter = OrderSubmitter::new(
            prevention.clone(),
            registry.clone(),
            clock.clone(),
            config.duplicate.max_submit_attempts,
            exchange_timeout,
        )
        .with_rate_limiter(Arc::new(SlidingWindowLimiter::new(
            window,
            config.rate_limit.max_requests,
        )));
        let backfill = BackfillTracker::in_memory(
            Arc::new(SlidingWindowLimiter::new(window, config.rate_limit.max_requests)),
            clock.clone(),
        );

        Ok(Self {
            config,
            clock,
            alerts,
            verifier,
            breakers,
            volatility,
            drawdown,
            kill_switch,
            gate,
            registry,
            ledger,
            prevention,
            submitter,
            backfill,
            metrics: EngineMetrics::default(),
        })
    }

    /// Run an order through the risk gate and count the outcome.
    pub fn check_order(&self, intent: &OrderIntent) -> Result<Approval, RiskReject> {
        self.metrics.orders_checked.fetch_add(1, Ordering::Relaxed);
        let outcome = self.gate.evaluate(intent);
        match &outcome {
            Ok(_) => self.metrics.orders_approved.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.metrics.orders_rejected.fetch_add(1, Ordering::Relaxed),
        };
        outcome
    }

    /// Auto-reset breakers, refresh drawdown cooldowns and release held
    /// volatility levels. A failing tenant is logged and skipped.
    pub fn run_reset_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.breakers.tenants() {
            Ok(tenants) => {
                for tenant in tenants {
                    match self.breakers.process_auto_reset(&tenant) {
                        Ok(r) => {
                            report.half_opened += r.half_opened.len();
                            report.closed += r.closed.len();
                            report.retripped += r.retripped.len();
                        }
                        Err(e) => {
                            tracing::warn!(tenant_id = %tenant, error = %e, "breaker auto-reset failed");
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "listing breaker tenants failed");
                report.failures += 1;
            }
        }

        match self.drawdown.tenants() {
            Ok(tenants) => {
                for tenant in tenants {
                    match self.drawdown.refresh(&tenant) {
                        Ok(changed) => report.drawdown_refreshed += changed.len(),
                        Err(e) => {
                            tracing::warn!(tenant_id = %tenant, error = %e, "drawdown refresh failed");
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "listing drawdown tenants failed");
                report.failures += 1;
            }
        }

        match self.volatility.refresh_cooldowns() {
            Ok(released) => report.volatility_released = released.len(),
            Err(e) => {
                tracing::warn!(error = %e, "volatility cooldown refresh failed");
                report.failures += 1;
            }
        }

        self.metrics
            .breakers_closed
            .fetch_add(report.closed as u64, Ordering::Relaxed);
        self.metrics
            .breakers_retripped
            .fetch_add(report.retripped as u64, Ordering::Relaxed);
        self.metrics
            .sweep_failures
            .fetch_add(report.failures as u64, Ordering::Relaxed);
        if report != SweepReport::default() {
            tracing::debug!(?report, "reset sweep");
        }
        report
    }

    /// Drop expired idempotency records and fail backfills that stopped
    /// making progress.
    pub fn run_prune_sweep(&self) -> PruneReport {
        let mut report = PruneReport::default();

        match self.prevention.prune_expired() {
            Ok(pruned) => {
                report.idempotency_pruned = pruned;
                if pruned > 0 {
                    tracing::info!(pruned, "expired idempotency records removed");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "idempotency prune failed");
                report.failures += 1;
            }
        }

        let stale_after = chrono::Duration::seconds(self.config.sweeps.backfill_stale_after_secs);
        match self.backfill.tenants() {
            Ok(tenants) => {
                for tenant in tenants {
                    match self.backfill.fail_stale(&tenant, stale_after) {
                        Ok(failed) => report.backfills_expired += failed.len(),
                        Err(e) => {
                            tracing::warn!(tenant_id = %tenant, error = %e, "stale backfill sweep failed");
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "listing backfill tenants failed");
                report.failures += 1;
            }
        }

        self.metrics
            .idempotency_pruned
            .fetch_add(report.idempotency_pruned as u64, Ordering::Relaxed);
        self.metrics
            .backfills_expired
            .fetch_add(report.backfills_expired as u64, Ordering::Relaxed);
        self.metrics
            .sweep_failures
            .fetch_add(report.failures as u64, Ordering::Relaxed);
        report
    }

    /// Run the HTTP server and sweep loops until ctrl-c or `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        tracing::info!(
            host = %self.config.server.host,
            port = self.config.server.port,
            "engine starting"
        );

        // ── 1. HTTP server ───────────────────────────────────────
        let server_engine = self.clone();
        let server_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = server::run_server(server_engine, server_cancel.clone()).await {
                tracing::error!(error = %e, "HTTP server failed");
                server_cancel.cancel();
            }
        });

        // ── 2. Auto-reset sweep ──────────────────────────────────
        let reset_engine = self.clone();
        let reset_cancel = cancel.clone();
        let reset_every = Duration::from_millis(self.config.sweeps.auto_reset_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(reset_every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        reset_engine.run_reset_sweep();
                    }
                    _ = reset_cancel.cancelled() => break,
                }
            }
            tracing::debug!("reset sweep stopped");
        });

        // ── 3. Idempotency / backfill prune ──────────────────────
        let prune_engine = self.clone();
        let prune_cancel = cancel.clone();
        let prune_every = Duration::from_millis(self.config.sweeps.prune_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(prune_every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        prune_engine.run_prune_sweep();
                    }
                    _ = prune_cancel.cancelled() => break,
                }
            }
            tracing::debug!("prune sweep stopped");
        });

        // ── Shutdown signal ──────────────────────────────────────
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = cancel.cancelled() => {
                tracing::info!("cancellation token triggered");
            }
        }
        cancel.cancel();
        tracing::info!("engine stopped");
        Ok(())
    }
}

/// Forward queued alerts to `out` until the channel closes or `cancel`
/// fires, then flush what is left. Delivery failures are logged and the
/// alert is dropped.
pub async fn forward_alerts(
    mut rx: mpsc::Receiver<Alert>,
    out: &dyn AlertSink,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            alert = rx.recv() => match alert {
                Some(alert) => dispatch_alert(out, alert),
                None => return,
            },
            _ = cancel.cancelled() => break,
        }
    }
    while let Ok(alert) = rx.try_recv() {
        dispatch_alert(out, alert);
    }
}
