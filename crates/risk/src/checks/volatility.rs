use std::sync::Arc;

use crate::pipeline::{Approval, OrderIntent, RiskCheck, RiskReject};
use crate::volatility::{apply_throttle, VolatilityService};

/// Blocks entries at EXTREME and throttles entry quantity at HIGH.
/// Exits pass untouched.
pub struct VolatilityCheck {
    service: Arc<VolatilityService>,
}

impl VolatilityCheck {
    pub fn new(service: Arc<VolatilityService>) -> Self {
        Self { service }
    }
}

impl RiskCheck for VolatilityCheck {
    fn name(&self) -> &str {
        "volatility"
    }

    fn check(&self, intent: &OrderIntent, approval: &mut Approval) -> Result<(), RiskReject> {
        if !intent.is_entry {
            return Ok(());
        }
        let decision = self
            .service
            .check_throttle(&intent.tenant_id, &intent.asset_id)
            .map_err(|e| RiskReject::unavailable(self.name(), e))?;
        if !decision.allow_new_entries {
            return Err(RiskReject::VolatilityBlocked {
                level: decision.level.to_string(),
                reason: "new entries are not allowed".to_string(),
            });
        }
        let throttled = apply_throttle(approval.approved_quantity, decision.throttle_percent);
        if throttled <= 0.0 {
            return Err(RiskReject::VolatilityBlocked {
                level: decision.level.to_string(),
                reason: format!("throttled to zero at {}%", decision.throttle_percent),
            });
        }
        approval.approved_quantity = throttled;
        approval.throttle_percent = decision.throttle_percent;
        Ok(())
    }
}
