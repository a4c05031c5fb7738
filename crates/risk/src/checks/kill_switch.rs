use std::sync::Arc;

use crate::kill_switch::KillSwitchService;
use crate::pipeline::{Approval, OrderIntent, RiskCheck, RiskReject};

/// Rejects everything (entries and exits) under an active kill switch.
pub struct KillSwitchCheck {
    service: Arc<KillSwitchService>,
}

impl KillSwitchCheck {
    pub fn new(service: Arc<KillSwitchService>) -> Self {
        Self { service }
    }
}

impl RiskCheck for KillSwitchCheck {
    fn name(&self) -> &str {
        "kill_switch"
    }

    fn check(&self, intent: &OrderIntent, _approval: &mut Approval) -> Result<(), RiskReject> {
        let blocked = self
            .service
            .is_blocked(
                &intent.tenant_id,
                intent.strategy_id.as_ref(),
                Some(&intent.asset_id),
            )
            .map_err(|e| RiskReject::unavailable(self.name(), e))?;
        match blocked {
            Some(state) => Err(RiskReject::KillSwitchActive {
                scope: state.scope.key(),
                reason: state.activation_reason.unwrap_or_default(),
            }),
            None => Ok(()),
        }
    }
}
