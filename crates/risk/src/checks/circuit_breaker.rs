use std::sync::Arc;

use crate::circuit_breaker::CircuitBreakerService;
use crate::pipeline::{Approval, OrderIntent, RiskCheck, RiskReject};

/// OPEN breakers block everything in scope; HALF_OPEN ones block entries.
pub struct CircuitBreakerCheck {
    service: Arc<CircuitBreakerService>,
}

impl CircuitBreakerCheck {
    pub fn new(service: Arc<CircuitBreakerService>) -> Self {
        Self { service }
    }
}

impl RiskCheck for CircuitBreakerCheck {
    fn name(&self) -> &str {
        "circuit_breaker"
    }

    fn check(&self, intent: &OrderIntent, _approval: &mut Approval) -> Result<(), RiskReject> {
        let blocking = self
            .service
            .blocking_breakers(
                &intent.tenant_id,
                Some(&intent.asset_id),
                intent.strategy_id.as_ref(),
            )
            .map_err(|e| RiskReject::unavailable(self.name(), e))?;
        let hit = blocking.into_iter().find(|b| {
            if intent.is_entry {
                b.blocks_entries()
            } else {
                b.blocks_exits()
            }
        });
        match hit {
            Some(b) => Err(RiskReject::CircuitBreakerOpen {
                breaker_id: b.breaker_id.to_string(),
                state: b.state.to_string(),
            }),
            None => Ok(()),
        }
    }
}
