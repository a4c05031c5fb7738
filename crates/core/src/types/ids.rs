//! Identifier newtypes shared across the risk core.
//!
//! Every persisted entity is owned by a [`TenantId`]; the other identifiers
//! name the scopes a control can apply to.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Owner of every risk entity. Cross-tenant access is impossible because
    /// every store key includes it.
    TenantId
);
string_id!(
    /// Tradable asset (e.g., "BTC-USD").
    AssetId
);
string_id!(
    /// Strategy instance identifier.
    StrategyId
);
string_id!(
    /// Exchange identifier used to select a per-tenant adapter (e.g., "binance").
    ExchangeId
);
string_id!(
    /// Client-side order identifier.
    OrderId
);
string_id!(
    /// Exchange-assigned order identifier.
    ExchangeOrderId
);
string_id!(
    /// Circuit breaker identifier.
    BreakerId
);

/// Reserved partition for market-wide entities that no single tenant owns.
const GLOBAL_TENANT: &str = "__global__";

impl TenantId {
    /// Partition used for shared market state such as volatility indices.
    pub fn global() -> Self {
        Self(GLOBAL_TENANT.to_string())
    }

    /// Returns `true` for the reserved market-wide partition.
    pub fn is_global(&self) -> bool {
        self.0 == GLOBAL_TENANT
    }
}
