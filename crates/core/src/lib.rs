//! # tg-core
//!
//! Shared building blocks for the trade-guard risk core: identifier types,
//! the wall clock, the tenant-partitioned repository abstraction, alert
//! delivery, layered configuration and tracing setup.

pub mod alert;
pub mod config;
pub mod logging;
pub mod store;
pub mod types;
