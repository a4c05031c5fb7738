//! Core types for the trade-guard risk core.
//!
//! Identifiers are string newtypes so tenants and scopes can never be mixed
//! up; time is wall-clock UTC behind the [`Clock`] trait.

pub mod clock;
pub mod ids;

// Re-export primary types for convenient access via `tg_core::types::*`.
pub use clock::{minutes, Clock, ManualClock, SystemClock};
pub use ids::{AssetId, BreakerId, ExchangeId, ExchangeOrderId, OrderId, StrategyId, TenantId};
