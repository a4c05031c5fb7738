//! Risk gate.
//!
//! Every order intent passes through a sequence of [`RiskCheck`]
//! implementations before it may be submitted. The standard order is
//! Kill Switch, Circuit Breaker, Drawdown, Volatility: coarsest and most
//! severe first. The first check that fails short-circuits the gate and
//! returns the rejection reason.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tg_core::types::{AssetId, StrategyId, TenantId};

use crate::checks::{CircuitBreakerCheck, DrawdownCheck, KillSwitchCheck, VolatilityCheck};
use crate::circuit_breaker::CircuitBreakerService;
use crate::drawdown::DrawdownService;
use crate::kill_switch::KillSwitchService;
use crate::volatility::VolatilityService;

/// An order the caller intends to place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub tenant_id: TenantId,
    #[serde(default)]
    pub strategy_id: Option<StrategyId>,
    pub asset_id: AssetId,
    /// Opens or increases exposure. Exits (`false`) are never blocked by
    /// drawdown or volatility.
    pub is_entry: bool,
    pub quantity: f64,
}

/// Quantity the gate lets through.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Approval {
    pub requested_quantity: f64,
    pub approved_quantity: f64,
    pub throttle_percent: f64,
}

/// Reason an action was blocked. [`RiskReject::code`] is stable and meant
/// for machines.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RiskReject {
    #[error("kill switch active ({scope}): {reason}")]
    KillSwitchActive { scope: String, reason: String },
    #[error("circuit breaker {breaker_id} is {state}")]
    CircuitBreakerOpen { breaker_id: String, state: String },
    #[error("drawdown {status} at {drawdown_percent:.2}%, new entries halted")]
    DrawdownHalted { status: String, drawdown_percent: f64 },
    #[error("volatility {level}: {reason}")]
    VolatilityBlocked { level: String, reason: String },
    #[error("duplicate order: {reason}")]
    DuplicateDetected { reason: String },
    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    /// A check could not run (storage failure). The gate fails closed.
    #[error("risk check {check} unavailable: {error}")]
    CheckUnavailable { check: String, error: String },
}

impl RiskReject {
    pub fn code(&self) -> &'static str {
        match self {
            RiskReject::KillSwitchActive { .. } => "kill_switch_active",
            RiskReject::CircuitBreakerOpen { .. } => "circuit_breaker_open",
            RiskReject::DrawdownHalted { .. } => "drawdown_halted",
            RiskReject::VolatilityBlocked { .. } => "volatility_blocked",
            RiskReject::DuplicateDetected { .. } => "duplicate_detected",
            RiskReject::RetriesExhausted { .. } => "retries_exhausted",
            RiskReject::InvalidOrder(_) => "invalid_order",
            RiskReject::CheckUnavailable { .. } => "risk_check_unavailable",
        }
    }

    pub(crate) fn unavailable(check: &str, error: impl std::fmt::Display) -> Self {
        RiskReject::CheckUnavailable {
            check: check.to_string(),
            error: error.to_string(),
        }
    }
}

/// Trait for individual pre-trade risk checks.
///
/// A check inspects the intent and either rejects it or passes, possibly
/// reducing the approved quantity.
pub trait RiskCheck: Send + Sync {
    /// Name for logging and diagnostics.
    fn name(&self) -> &str;

    fn check(&self, intent: &OrderIntent, approval: &mut Approval) -> Result<(), RiskReject>;
}

/// Runs registered checks in insertion order.
pub struct RiskGate {
    checks: Vec<Box<dyn RiskCheck>>,
}

impl RiskGate {
    pub fn new() -> Self {
        Self { checks: Vec::new() }
    }

    /// Kill Switch, Circuit Breaker, Drawdown, Volatility.
    pub fn standard(
        kill_switch: Arc<KillSwitchService>,
        breakers: Arc<CircuitBreakerService>,
        drawdown: Arc<DrawdownService>,
        volatility: Arc<VolatilityService>,
    ) -> Self {
        let mut gate = Self::new();
        gate.add_check(KillSwitchCheck::new(kill_switch));
        gate.add_check(CircuitBreakerCheck::new(breakers));
        gate.add_check(DrawdownCheck::new(drawdown));
        gate.add_check(VolatilityCheck::new(volatility));
        gate
    }

    pub fn add_check(&mut self, check: impl RiskCheck + 'static) {
        self.checks.push(Box::new(check));
    }

    pub fn check_count(&self) -> usize {
        self.checks.len()
    }

    /// Evaluate `intent`. Returns the approval or the first rejection.
    pub fn evaluate(&self, intent: &OrderIntent) -> Result<Approval, RiskReject> {
        if !intent.quantity.is_finite() || intent.quantity <= 0.0 {
            return Err(RiskReject::InvalidOrder(format!(
                "quantity must be positive, got {}",
                intent.quantity
            )));
        }
        let mut approval = Approval {
            requested_quantity: intent.quantity,
            approved_quantity: intent.quantity,
            throttle_percent: 0.0,
        };
        for check in &self.checks {
            if let Err(reject) = check.check(intent, &mut approval) {
                tracing::info!(
                    tenant_id = %intent.tenant_id,
                    asset_id = %intent.asset_id,
                    check = check.name(),
                    code = reject.code(),
                    reason = %reject,
                    "order intent rejected"
                );
                return Err(reject);
            }
        }
        Ok(approval)
    }
}

impl Default for RiskGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tg_core::alert::RecordingAlertSink;
    use tg_core::config::CircuitBreakerDefaults;
    use tg_core::types::{BreakerId, Clock, ManualClock};

    use crate::circuit_breaker::{BreakerCondition, BreakerContext, BreakerScope, NewBreaker};
    use crate::drawdown::{DrawdownConfig, DrawdownScope, ResetInterval};
    use crate::kill_switch::{KillSwitchConfig, KillSwitchScope, NoopCanceller, StaticTokenVerifier};
    use crate::volatility::{IndexType, VolatilityConfig};

    struct AlwaysReject;

    impl RiskCheck for AlwaysReject {
        fn name(&self) -> &str {
            "always_reject"
        }
        fn check(&self, _intent: &OrderIntent, _approval: &mut Approval) -> Result<(), RiskReject> {
            Err(RiskReject::InvalidOrder("nope".into()))
        }
    }

    struct Halve;

    impl RiskCheck for Halve {
        fn name(&self) -> &str {
            "halve"
        }
        fn check(&self, _intent: &OrderIntent, approval: &mut Approval) -> Result<(), RiskReject> {
            approval.approved_quantity /= 2.0;
            Ok(())
        }
    }

    struct Services {
        ks: Arc<KillSwitchService>,
        cb: Arc<CircuitBreakerService>,
        dd: Arc<DrawdownService>,
        vol: Arc<VolatilityService>,
    }

    fn make_services() -> Services {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let alerts = Arc::new(RecordingAlertSink::new());
        Services {
            ks: Arc::new(KillSwitchService::in_memory(
                Arc::new(StaticTokenVerifier::new(vec!["op".to_string()])),
                Arc::new(NoopCanceller),
                alerts.clone(),
                clock.clone(),
                KillSwitchConfig {
                    require_auth_for_deactivation: true,
                    triggers: vec![],
                },
            )),
            cb: Arc::new(CircuitBreakerService::in_memory(
                alerts.clone(),
                clock.clone(),
                CircuitBreakerDefaults {
                    cooldown_minutes: 15,
                    auto_reset_enabled: true,
                },
            )),
            dd: Arc::new(
                DrawdownService::in_memory(
                    alerts.clone(),
                    clock.clone(),
                    DrawdownConfig {
                        warning_threshold_percent: 5.0,
                        max_threshold_percent: 10.0,
                        reset_interval: ResetInterval::Daily,
                        auto_resume_enabled: true,
                        cooldown_minutes: 60,
                        pause_on_critical: true,
                    },
                )
                .unwrap(),
            ),
            vol: Arc::new(
                VolatilityService::in_memory(
                    alerts,
                    clock,
                    VolatilityConfig {
                        normal_threshold: 20.0,
                        high_threshold: 50.0,
                        extreme_threshold: 80.0,
                        high_throttle_percent: 50.0,
                        extreme_throttle_percent: 100.0,
                        cooldown_minutes: 30,
                    },
                )
                .unwrap(),
            ),
        }
    }

    fn make_gate(s: &Services) -> RiskGate {
        RiskGate::standard(s.ks.clone(), s.cb.clone(), s.dd.clone(), s.vol.clone())
    }

    fn make_intent(is_entry: bool) -> OrderIntent {
        OrderIntent {
            tenant_id: TenantId::new("acme"),
            strategy_id: Some(StrategyId::new("mm-1")),
            asset_id: AssetId::new("BTC-USD"),
            is_entry,
            quantity: 100.0,
        }
    }

    #[test]
    fn test_empty_gate_approves() {
        let gate = RiskGate::new();
        let a = gate.evaluate(&make_intent(true)).unwrap();
        assert_eq!(a.approved_quantity, 100.0);
    }

    #[test]
    fn test_short_circuit_on_first_reject() {
        let mut gate = RiskGate::new();
        gate.add_check(AlwaysReject);
        gate.add_check(Halve);
        assert_eq!(gate.check_count(), 2);
        assert!(gate.evaluate(&make_intent(true)).is_err());
    }

    #[test]
    fn test_checks_can_reduce_quantity() {
        let mut gate = RiskGate::new();
        gate.add_check(Halve);
        gate.add_check(Halve);
        let a = gate.evaluate(&make_intent(true)).unwrap();
        assert_eq!(a.approved_quantity, 25.0);
        assert_eq!(a.requested_quantity, 100.0);
    }

    #[test]
    fn test_invalid_quantity() {
        let gate = RiskGate::new();
        let mut intent = make_intent(true);
        intent.quantity = 0.0;
        assert_eq!(gate.evaluate(&intent).unwrap_err().code(), "invalid_order");
        intent.quantity = f64::NAN;
        assert!(gate.evaluate(&intent).is_err());
    }

    #[test]
    fn test_standard_gate_clean_state_approves() {
        let s = make_services();
        let gate = make_gate(&s);
        assert_eq!(gate.check_count(), 4);
        let a = gate.evaluate(&make_intent(true)).unwrap();
        assert_eq!(a.approved_quantity, 100.0);
    }

    #[tokio::test]
    async fn test_kill_switch_takes_priority() {
        let s = make_services();
        let tenant = TenantId::new("acme");
        s.vol
            .update_volatility_index(&AssetId::new("BTC-USD"), 90.0, IndexType::StdDev, None)
            .unwrap();
        s.ks.activate(&tenant, &KillSwitchScope::Tenant, "halt", None)
            .await
            .unwrap();

        let gate = make_gate(&s);
        let err = gate.evaluate(&make_intent(true)).unwrap_err();
        assert_eq!(err.code(), "kill_switch_active");
        // Kill switch halts exits too.
        let err = gate.evaluate(&make_intent(false)).unwrap_err();
        assert_eq!(err.code(), "kill_switch_active");
    }

    #[test]
    fn test_open_breaker_rejects() {
        let s = make_services();
        let tenant = TenantId::new("acme");
        s.cb.create_breaker(
            &tenant,
            NewBreaker {
                breaker_id: Some(BreakerId::new("cb-1")),
                name: "loss".into(),
                scope: BreakerScope::Asset,
                scope_id: Some("BTC-USD".into()),
                condition: BreakerCondition::LossRate { loss_percent: 10.0 },
                cooldown_minutes: None,
                auto_reset_enabled: None,
            },
        )
        .unwrap();
        s.cb.check_breakers(
            &tenant,
            &BreakerContext {
                asset_id: Some(AssetId::new("BTC-USD")),
                recent_loss_percent: 12.0,
                ..Default::default()
            },
        )
        .unwrap();

        let gate = make_gate(&s);
        assert_eq!(
            gate.evaluate(&make_intent(true)).unwrap_err().code(),
            "circuit_breaker_open"
        );
        let mut other = make_intent(true);
        other.asset_id = AssetId::new("ETH-USD");
        assert!(gate.evaluate(&other).is_ok());
    }

    #[test]
    fn test_half_open_breaker_allows_exits() {
        let s = make_services();
        let tenant = TenantId::new("acme");
        let id = BreakerId::new("cb-1");
        s.cb.create_breaker(
            &tenant,
            NewBreaker {
                breaker_id: Some(id.clone()),
                name: "loss".into(),
                scope: BreakerScope::Portfolio,
                scope_id: None,
                condition: BreakerCondition::LossRate { loss_percent: 10.0 },
                cooldown_minutes: None,
                auto_reset_enabled: None,
            },
        )
        .unwrap();
        s.cb.trip_breaker(&tenant, &id, "manual").unwrap();
        s.cb.transition_to_half_open(&tenant, &id).unwrap();

        let gate = make_gate(&s);
        assert!(gate.evaluate(&make_intent(true)).is_err());
        assert!(gate.evaluate(&make_intent(false)).is_ok());
    }

    #[test]
    fn test_drawdown_blocks_entries_only() {
        let s = make_services();
        let tenant = TenantId::new("acme");
        let scope = DrawdownScope::Portfolio;
        s.dd.update_value(&tenant, &scope, 1000.0).unwrap();
        s.dd.update_value(&tenant, &scope, 850.0).unwrap();

        let gate = make_gate(&s);
        assert_eq!(
            gate.evaluate(&make_intent(true)).unwrap_err().code(),
            "drawdown_halted"
        );
        assert!(gate.evaluate(&make_intent(false)).is_ok());
    }

    #[test]
    fn test_volatility_throttles_and_blocks() {
        let s = make_services();
        let btc = AssetId::new("BTC-USD");
        let gate = make_gate(&s);

        s.vol.update_volatility_index(&btc, 60.0, IndexType::StdDev, None).unwrap();
        let a = gate.evaluate(&make_intent(true)).unwrap();
        assert_eq!(a.throttle_percent, 50.0);
        assert_eq!(a.approved_quantity, 50.0);

        s.vol.update_volatility_index(&btc, 85.0, IndexType::StdDev, None).unwrap();
        assert_eq!(
            gate.evaluate(&make_intent(true)).unwrap_err().code(),
            "volatility_blocked"
        );
        let exit = gate.evaluate(&make_intent(false)).unwrap();
        assert_eq!(exit.approved_quantity, 100.0);
    }

    #[test]
    fn test_reject_codes_are_distinct() {
        let rejects = [
            RiskReject::KillSwitchActive {
                scope: "tenant".into(),
                reason: "x".into(),
            },
            RiskReject::CircuitBreakerOpen {
                breaker_id: "cb".into(),
                state: "OPEN".into(),
            },
            RiskReject::DrawdownHalted {
                status: "PAUSED".into(),
                drawdown_percent: 12.0,
            },
            RiskReject::VolatilityBlocked {
                level: "EXTREME".into(),
                reason: "x".into(),
            },
            RiskReject::DuplicateDetected { reason: "x".into() },
            RiskReject::RetriesExhausted {
                attempts: 3,
                last_error: "x".into(),
            },
        ];
        let mut codes: Vec<_> = rejects.iter().map(|r| r.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), rejects.len());
    }
}
