use async_trait::async_trait;
use thiserror::Error;

use statcrunch_core::{
    AggregationQuery, CrunchError, Dimension, DimensionId, EntityStat, HeroStats, StatFields,
    StatsId,
};

/// Destination store operation error.
///
/// Only two outcomes matter to the job runner: whether running the job again
/// could help or not.
///
/// - **Transient**: connection drops, timeouts, deadlocks, serialization
///   failures and any database condition not known to be permanent
/// - **Constraint**: the store rejected a write as an integrity violation
/// - **Data**: the stored rows cannot be evaluated (SQLSTATE class `22`)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Constraint(String),

    #[error("{0}")]
    Data(String),
}

impl From<StoreError> for CrunchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transient(msg) => CrunchError::StoreTransient(msg),
            StoreError::Constraint(msg) => CrunchError::StoreConstraint(msg),
            StoreError::Data(msg) => CrunchError::StoreData(msg),
        }
    }
}

/// The analytics store rollups are read from and written to.
///
/// All work for one job happens inside a single [`StatsTx`]; nothing written
/// through it is visible to other readers before [`StatsTx::commit`].
#[async_trait]
pub trait StatsStore: Send + Sync {
    type Tx: StatsTx;

    /// Open a transaction.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Release pooled connections. Further `begin` calls fail.
    async fn close(&self);
}

/// An open transaction against the analytics store.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait StatsTx: Send {
    /// Look up a dimension by id.
    async fn fetch_dimension(&mut self, id: DimensionId) -> Result<Option<Dimension>, StoreError>;

    /// Run an aggregation and return one row per hero present in its scope,
    /// ordered by hero id.
    async fn aggregate(&mut self, query: &AggregationQuery) -> Result<Vec<HeroStats>, StoreError>;

    /// Insert a `stats` row and return its generated id.
    async fn insert_stats(&mut self, fields: &StatFields) -> Result<StatsId, StoreError>;

    /// Insert a `hero_stats` link row.
    async fn insert_entity_stat(&mut self, link: &EntityStat) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}
