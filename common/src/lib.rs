//! Ledgerflow Common Types
//!
//! Shared types used across the ledgerflow workspace: numeric and public
//! identifiers, currency and amount helpers, the transfer state machine and
//! the error taxonomy surfaced to callers of the transfer engine.

pub mod identifiers;
pub mod monetary;
pub mod transfer;
pub mod error;

pub use identifiers::*;
pub use monetary::*;
pub use transfer::*;
pub use error::*;
