//! Analytics store boundary.
//!
//! The cruncher talks to the destination database only through the
//! [`StatsStore`]/[`StatsTx`] pair. `postgres` is the production backend;
//! `in_memory` evaluates the same aggregation semantics for tests/dev.

pub mod in_memory;
pub mod postgres;
pub mod sql;
pub mod r#trait;

pub use in_memory::{InMemoryStatsStore, MatchRow, ParticipantRow, StoreFault};
pub use postgres::PgStatsStore;
pub use r#trait::{StatsStore, StatsTx, StoreError};
