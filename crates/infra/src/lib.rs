//! Infrastructure layer: configuration, analytics store, job queue and the
//! crunch worker.

pub mod config;
pub mod crunch;
pub mod jobs;
pub mod store;

pub use config::{ConfigError, CrunchConfig, DbConfig, WorkerConfig};
pub use crunch::{CrunchState, Cruncher};
pub use jobs::{InMemoryJobQueue, JobQueue, PgJobQueue, Worker, WorkerRunner};
pub use store::{InMemoryStatsStore, PgStatsStore, StatsStore, StatsTx, StoreError};
