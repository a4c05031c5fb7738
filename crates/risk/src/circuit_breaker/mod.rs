//! Per-scope circuit breakers.
//!
//! A breaker watches one signal (loss rate, failure streak, price deviation
//! or error rate) for an asset, a strategy or the whole portfolio of a
//! tenant. State machine:
//!
//! ```text
//! CLOSED --trip--> OPEN --cooldown (auto-reset)--> HALF_OPEN --clear--> CLOSED
//!                   ^                                  |
//!                   +------------re-trip---------------+
//! ```
//!
//! OPEN blocks all orders in scope; HALF_OPEN only blocks new entries.
//! Breakers are persisted through a [`Repository`](tg_core::store::Repository)
//! and mutated with a version compare-and-swap, so concurrent evaluations
//! never double-count `trip_count`.

mod condition;
mod history;
mod service;

pub use condition::{
    evaluate_condition, BreakerCondition, BreakerContext, ConditionResult, ContextProvider,
    ContextSnapshots,
};
pub use history::{BreakerEvent, BreakerEventKind, BreakerHistory, MAX_HISTORY_EVENTS};
pub use service::{AutoResetReport, BreakerCheck, CircuitBreakerService, NewBreaker};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tg_core::store::Versioned;
use tg_core::types::{AssetId, BreakerId, StrategyId, TenantId};

/// Granularity a breaker applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerScope {
    Asset,
    Strategy,
    Portfolio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        })
    }
}

/// A persisted circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub breaker_id: BreakerId,
    pub tenant_id: TenantId,
    pub name: String,
    pub scope: BreakerScope,
    /// Asset or strategy id. Empty for portfolio breakers.
    pub scope_id: String,
    pub condition: BreakerCondition,
    pub state: BreakerState,
    /// Never decreases.
    pub trip_count: u64,
    pub last_tripped_at: Option<DateTime<Utc>>,
    pub cooldown_minutes: u32,
    pub auto_reset_enabled: bool,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Versioned for CircuitBreaker {
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl CircuitBreaker {
    /// Does this breaker cover the scope described by `ctx`?
    pub fn applies_to(&self, ctx: &BreakerContext) -> bool {
        self.covers(ctx.asset_id.as_ref(), ctx.strategy_id.as_ref())
    }

    /// Does this breaker cover an order on `asset` placed by `strategy`?
    pub fn covers(&self, asset: Option<&AssetId>, strategy: Option<&StrategyId>) -> bool {
        match self.scope {
            BreakerScope::Asset => asset.is_some_and(|a| a.as_str() == self.scope_id),
            BreakerScope::Strategy => strategy.is_some_and(|s| s.as_str() == self.scope_id),
            BreakerScope::Portfolio => true,
        }
    }

    /// Blocks new entries (OPEN or HALF_OPEN).
    pub fn blocks_entries(&self) -> bool {
        self.state != BreakerState::Closed
    }

    /// Blocks exits as well (OPEN only).
    pub fn blocks_exits(&self) -> bool {
        self.state == BreakerState::Open
    }

    pub(crate) fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_tripped_at {
            Some(at) => now - at >= chrono::Duration::minutes(i64::from(self.cooldown_minutes)),
            None => true,
        }
    }
}
