//! # tg-risk
//!
//! Tenant-scoped trading risk controls. Four layered mechanisms decide
//! whether an order may proceed, from coarsest to finest:
//!
//! - [`kill_switch`]: binary per-scope halt, cancels pending orders on
//!   activation
//! - [`circuit_breaker`]: CLOSED/OPEN/HALF_OPEN state machine tripped by
//!   loss, failure, deviation and error-rate conditions
//! - [`drawdown`]: peak-to-current tracking with graduated status
//! - [`volatility`]: index-driven throttling of new entries
//!
//! [`pipeline::RiskGate`] composes them in that order. Shared leveled
//! thresholds and hysteresis live in [`threshold`].

pub mod checks;
pub mod circuit_breaker;
pub mod drawdown;
pub mod error;
pub mod http;
pub mod kill_switch;
pub mod pipeline;
pub mod threshold;
pub mod volatility;

pub use error::{CircuitBreakerError, RiskError, RiskResult};
pub use pipeline::{Approval, OrderIntent, RiskCheck, RiskGate, RiskReject};
