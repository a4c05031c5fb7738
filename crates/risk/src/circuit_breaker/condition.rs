//! Breaker trip conditions and the market context they are evaluated against.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use tg_core::types::{AssetId, BreakerId, StrategyId, TenantId};

use super::{BreakerScope, CircuitBreaker};

/// What makes a breaker trip. Each variant carries its own threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerCondition {
    /// Recent realised loss, in percent.
    LossRate { loss_percent: f64 },
    /// Failed operations in a row.
    ConsecutiveFailures { max_failures: u32 },
    /// Absolute price deviation from reference, in percent.
    PriceDeviation { max_deviation_percent: f64 },
    /// Fraction of failed requests, `0.0..=1.0`.
    ErrorRate { max_error_rate: f64 },
}

impl BreakerCondition {
    pub fn threshold(&self) -> f64 {
        match *self {
            BreakerCondition::LossRate { loss_percent } => loss_percent,
            BreakerCondition::ConsecutiveFailures { max_failures } => f64::from(max_failures),
            BreakerCondition::PriceDeviation {
                max_deviation_percent,
            } => max_deviation_percent,
            BreakerCondition::ErrorRate { max_error_rate } => max_error_rate,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BreakerCondition::LossRate { .. } => "LOSS_RATE",
            BreakerCondition::ConsecutiveFailures { .. } => "CONSECUTIVE_FAILURES",
            BreakerCondition::PriceDeviation { .. } => "PRICE_DEVIATION",
            BreakerCondition::ErrorRate { .. } => "ERROR_RATE",
        }
    }

    /// Reject thresholds that could never (or always) trip.
    pub fn validate(&self) -> Result<(), String> {
        let t = self.threshold();
        if !t.is_finite() || t <= 0.0 {
            return Err(format!(
                "{} threshold must be a positive finite number, got {}",
                self.name(),
                t
            ));
        }
        if let BreakerCondition::ErrorRate { max_error_rate } = self {
            if *max_error_rate > 1.0 {
                return Err(format!(
                    "ERROR_RATE threshold is a fraction in (0, 1], got {}",
                    max_error_rate
                ));
            }
        }
        Ok(())
    }
}

/// Market and trading signals a breaker is evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerContext {
    pub asset_id: Option<AssetId>,
    pub strategy_id: Option<StrategyId>,
    #[serde(default)]
    pub recent_loss_percent: f64,
    #[serde(default)]
    pub recent_error_rate: f64,
    #[serde(default)]
    pub price_deviation: f64,
    /// Explicit failure streak. When absent, the breaker's event history
    /// supplies it.
    #[serde(default)]
    pub consecutive_failures: Option<u32>,
}

/// Result of [`evaluate_condition`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConditionResult {
    pub triggered: bool,
    pub current_value: f64,
    pub threshold: f64,
}

/// Evaluate one condition against a context.
///
/// Every condition type triggers when `current_value >= threshold`. A
/// non-finite signal (NaN from a broken feed) always triggers.
pub fn evaluate_condition(condition: &BreakerCondition, ctx: &BreakerContext) -> ConditionResult {
    let current_value = match condition {
        BreakerCondition::LossRate { .. } => ctx.recent_loss_percent,
        BreakerCondition::ConsecutiveFailures { .. } => {
            f64::from(ctx.consecutive_failures.unwrap_or(0))
        }
        BreakerCondition::PriceDeviation { .. } => ctx.price_deviation.abs(),
        BreakerCondition::ErrorRate { .. } => ctx.recent_error_rate,
    };
    let threshold = condition.threshold();
    ConditionResult {
        triggered: !current_value.is_finite() || current_value >= threshold,
        current_value,
        threshold,
    }
}

/// Supplies the latest context for a breaker when no caller is in the loop
/// (auto-reset sweeps).
pub trait ContextProvider: Send + Sync {
    fn context_for(&self, tenant: &TenantId, breaker: &CircuitBreaker) -> Option<BreakerContext>;

    /// `breaker` just moved to OPEN. Context seen before this point must not
    /// be used to re-evaluate it.
    fn breaker_tripped(&self, _tenant: &TenantId, _breaker: &CircuitBreaker) {}
}

struct Snapshot {
    context: BreakerContext,
    seq: u64,
}

/// In-process cache of the most recent context seen per (tenant, scope).
///
/// Contexts naming an asset or strategy are filed under that scope only;
/// portfolio breakers see contexts that name neither. A snapshot recorded
/// before a breaker's last trip is never handed back for that breaker.
#[derive(Default)]
pub struct ContextSnapshots {
    latest: DashMap<(TenantId, String), Snapshot>,
    /// Per breaker, the last sequence number recorded before it tripped.
    stale_through: DashMap<(TenantId, BreakerId), u64>,
    seq: AtomicU64,
}

impl ContextSnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `ctx` for every scope it describes.
    pub fn record(&self, tenant: &TenantId, ctx: &BreakerContext) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut keys = Vec::with_capacity(2);
        if let Some(asset) = &ctx.asset_id {
            keys.push(scope_key(BreakerScope::Asset, asset.as_str()));
        }
        if let Some(strategy) = &ctx.strategy_id {
            keys.push(scope_key(BreakerScope::Strategy, strategy.as_str()));
        }
        if keys.is_empty() {
            keys.push(scope_key(BreakerScope::Portfolio, ""));
        }
        for key in keys {
            self.latest.insert(
                (tenant.clone(), key),
                Snapshot {
                    context: ctx.clone(),
                    seq,
                },
            );
        }
    }
}

impl ContextProvider for ContextSnapshots {
    fn context_for(&self, tenant: &TenantId, breaker: &CircuitBreaker) -> Option<BreakerContext> {
        let snapshot = self
            .latest
            .get(&(tenant.clone(), scope_key(breaker.scope, &breaker.scope_id)))?;
        let stale_through = self
            .stale_through
            .get(&(tenant.clone(), breaker.breaker_id.clone()))
            .map(|s| *s)
            .unwrap_or(0);
        (snapshot.seq > stale_through).then(|| snapshot.context.clone())
    }

    fn breaker_tripped(&self, tenant: &TenantId, breaker: &CircuitBreaker) {
        self.stale_through.insert(
            (tenant.clone(), breaker.breaker_id.clone()),
            self.seq.load(Ordering::SeqCst),
        );
    }
}

fn scope_key(scope: BreakerScope, id: &str) -> String {
    match scope {
        BreakerScope::Asset => format!("asset:{}", id),
        BreakerScope::Strategy => format!("strategy:{}", id),
        BreakerScope::Portfolio => "portfolio".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_ctx() -> BreakerContext {
        BreakerContext {
            asset_id: Some(AssetId::new("BTC-USD")),
            ..Default::default()
        }
    }

    #[test]
    fn test_loss_rate_boundary_inclusive() {
        let cond = BreakerCondition::LossRate { loss_percent: 10.0 };
        let mut ctx = make_ctx();

        ctx.recent_loss_percent = 9.99;
        assert!(!evaluate_condition(&cond, &ctx).triggered);

        ctx.recent_loss_percent = 10.0;
        let r = evaluate_condition(&cond, &ctx);
        assert!(r.triggered);
        assert_eq!(r.current_value, 10.0);
        assert_eq!(r.threshold, 10.0);
    }

    #[test]
    fn test_error_rate_boundary_inclusive() {
        let cond = BreakerCondition::ErrorRate { max_error_rate: 0.5 };
        let mut ctx = make_ctx();
        ctx.recent_error_rate = 0.49;
        assert!(!evaluate_condition(&cond, &ctx).triggered);
        ctx.recent_error_rate = 0.5;
        assert!(evaluate_condition(&cond, &ctx).triggered);
    }

    #[test]
    fn test_consecutive_failures() {
        let cond = BreakerCondition::ConsecutiveFailures { max_failures: 3 };
        let mut ctx = make_ctx();
        assert!(!evaluate_condition(&cond, &ctx).triggered);
        ctx.consecutive_failures = Some(2);
        assert!(!evaluate_condition(&cond, &ctx).triggered);
        ctx.consecutive_failures = Some(3);
        assert!(evaluate_condition(&cond, &ctx).triggered);
    }

    #[test]
    fn test_price_deviation_uses_magnitude() {
        let cond = BreakerCondition::PriceDeviation {
            max_deviation_percent: 5.0,
        };
        let mut ctx = make_ctx();
        ctx.price_deviation = -6.0;
        let r = evaluate_condition(&cond, &ctx);
        assert!(r.triggered);
        assert_eq!(r.current_value, 6.0);
    }

    #[test]
    fn test_nan_signal_triggers() {
        let cond = BreakerCondition::LossRate { loss_percent: 10.0 };
        let mut ctx = make_ctx();
        ctx.recent_loss_percent = f64::NAN;
        assert!(evaluate_condition(&cond, &ctx).triggered);
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let cond = BreakerCondition::LossRate { loss_percent: 10.0 };
        let mut ctx = make_ctx();
        ctx.recent_loss_percent = 12.0;
        let a = evaluate_condition(&cond, &ctx);
        let b = evaluate_condition(&cond, &ctx);
        assert_eq!(a, b);
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        assert!(BreakerCondition::LossRate { loss_percent: 0.0 }.validate().is_err());
        assert!(BreakerCondition::LossRate {
            loss_percent: f64::NAN
        }
        .validate()
        .is_err());
        assert!(BreakerCondition::ConsecutiveFailures { max_failures: 0 }
            .validate()
            .is_err());
        assert!(BreakerCondition::ErrorRate { max_error_rate: 1.5 }
            .validate()
            .is_err());
        assert!(BreakerCondition::ErrorRate { max_error_rate: 0.2 }
            .validate()
            .is_ok());
    }

    #[test]
    fn test_condition_serde_shape() {
        let json = serde_json::to_value(BreakerCondition::LossRate { loss_percent: 10.0 }).unwrap();
        assert_eq!(json["type"], "LOSS_RATE");
        assert_eq!(json["loss_percent"], 10.0);
    }
}
