//! `statcrunch-core`: domain types of the stats cruncher.
//!
//! This crate is pure (no I/O): dimensions, aggregation scopes, rollup rows
//! and the failure taxonomy shared by the store and the job runner.

pub mod dimension;
pub mod error;
pub mod id;
pub mod query;
pub mod stats;

pub use dimension::{CrunchPayload, Dimension, EntityKind, FieldName};
pub use error::{CrunchError, CrunchResult, FailureKind};
pub use id::{DimensionId, HeroId, StatsId};
pub use query::{AggregationQuery, Scope};
pub use stats::{EntityStat, HeroStats, StatFields, StatRow};
