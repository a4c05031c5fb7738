//! The four standard [`RiskCheck`](crate::pipeline::RiskCheck)s, one per control.

pub mod circuit_breaker;
pub mod drawdown;
pub mod kill_switch;
pub mod volatility;

pub use circuit_breaker::CircuitBreakerCheck;
pub use drawdown::DrawdownCheck;
pub use kill_switch::KillSwitchCheck;
pub use volatility::VolatilityCheck;
