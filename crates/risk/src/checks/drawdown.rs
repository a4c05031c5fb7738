use std::sync::Arc;

use crate::drawdown::DrawdownService;
use crate::pipeline::{Approval, OrderIntent, RiskCheck, RiskReject};

/// Rejects new entries while the portfolio or the order's strategy is
/// paused on drawdown.
pub struct DrawdownCheck {
    service: Arc<DrawdownService>,
}

impl DrawdownCheck {
    pub fn new(service: Arc<DrawdownService>) -> Self {
        Self { service }
    }
}

impl RiskCheck for DrawdownCheck {
    fn name(&self) -> &str {
        "drawdown"
    }

    fn check(&self, intent: &OrderIntent, _approval: &mut Approval) -> Result<(), RiskReject> {
        if !intent.is_entry {
            return Ok(());
        }
        let blocked = self
            .service
            .entry_block(&intent.tenant_id, intent.strategy_id.as_ref())
            .map_err(|e| RiskReject::unavailable(self.name(), e))?;
        match blocked {
            Some(state) => Err(RiskReject::DrawdownHalted {
                status: state.status.to_string(),
                drawdown_percent: state.drawdown_percent,
            }),
            None => Ok(()),
        }
    }
}
