//! `db` crate: pure persistence layer.
//!
//! Provides the record types for work items, stage instances, approvals and
//! the activity log, the transactional [`Store`] seam the engine writes
//! through, and two implementations of it: [`MemoryStore`] and [`PgStore`].
//! No orchestration logic lives here.

pub mod error;
pub mod models;
pub mod store;
pub mod memory;
pub mod postgres;
pub mod repository;

pub use error::DbError;
pub use memory::{FailPoint, MemoryStore, MemoryTx};
pub use postgres::{DbPool, PgStore, PgTx};
pub use store::{Store, StoreTx};
