//! # tg-oms
//!
//! The order path after the risk gate: duplicate order prevention
//! (idempotency keys plus exchange cross-checks), the order ledger, the
//! exchange adapter seam, bounded-retry submission, per-source rate
//! limiting and historical backfill tracking.

pub mod backfill;
pub mod cancel;
pub mod duplicate;
pub mod error;
pub mod exchange;
pub mod idempotency;
pub mod ledger;
pub mod rate_limit;
pub mod submit;

pub use cancel::LedgerCanceller;
pub use duplicate::{DuplicateCheck, DuplicateOrderPrevention, RetryDecision, RetryRequest};
pub use error::{OmsError, OmsResult};
pub use exchange::{AdapterRegistry, ExchangeAdapter, ExchangeOrderStatus, OrderLookup, PaperExchange};
pub use idempotency::{IdempotencyRecord, IdempotencyRecords, IdempotencyStatus, NewIdempotencyRecord};
pub use ledger::{OrderLedger, OrderRecord, OrderStatus};
pub use rate_limit::SlidingWindowLimiter;
pub use submit::{OrderSubmitter, SubmitReceipt, SubmitRequest};
