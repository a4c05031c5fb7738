//! # tg-service
//!
//! Wires the risk controls and order-path guards into one [`RiskEngine`],
//! runs the periodic sweeps and serves the HTTP API.

pub mod engine;
pub mod server;

pub use engine::{forward_alerts, EngineMetrics, PruneReport, RiskEngine, SweepReport};
