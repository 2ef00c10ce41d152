//! Ledgerflow Ledger
//!
//! Double-entry ledger with ACID transfers. The [`TransferEngine`] composes
//! [`LedgerStore`] primitives inside a [`UnitOfWork`] and always locks account
//! rows in ascending id order.
//!
//! Two storage adapters are provided: [`PgLedger`] for PostgreSQL and
//! [`MemoryLedger`] for tests and simulation.

pub mod account;
pub mod engine;
pub mod journal;
pub mod memory;
pub mod ordering;
pub mod postgres;
pub mod store;
pub mod unit_of_work;

pub use account::{Account, NewAccount};
pub use engine::{EngineConfig, TransferEngine};
pub use journal::{
    Entry, EntryKind, JournalBatch, NewEntry, NewTransaction, Transaction, TransferResult,
};
pub use memory::{MemoryLedger, MemoryLedgerConfig, MemoryLedgerTx};
pub use ordering::{lock_order, ordered_legs, BalanceLeg};
pub use postgres::{PgLedger, PgLedgerConfig, PgLedgerTx};
pub use store::{Ledger, LedgerStore, LedgerTx, Page};
pub use unit_of_work::UnitOfWork;
