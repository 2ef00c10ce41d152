//! Identifier types for ledger entities.
//!
//! Rows are keyed by database-assigned numeric identifiers. The numeric
//! ordering of [`AccountId`] is load-bearing: the transfer engine acquires
//! account row locks in ascending id order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw database key.
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            /// Get the raw database key.
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

numeric_id!(
    /// Stable numeric key of an account row.
    AccountId
);

numeric_id!(
    /// Numeric key of an immutable ledger entry.
    EntryId
);

numeric_id!(
    /// Numeric key of a transfer record.
    TransactionId
);
