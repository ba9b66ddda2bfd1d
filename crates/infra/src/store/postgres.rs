//! Postgres-backed analytics store.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database | class `23` (e.g. `23505`, `23503`) | `Constraint` | Integrity violation on insert or deferred at commit |
//! | Database | class `22` (e.g. `22012`, `22003`) | `Data` | Division by zero, numeric overflow in stored rows |
//! | Database | `40001`, `40P01` | `Transient` | Serialization failure / deadlock |
//! | Database | `57014`, class `08` | `Transient` | Statement timeout / connection exception |
//! | Database | any other | `Transient` | Unknown database condition |
//! | Io, PoolTimedOut, PoolClosed | N/A | `Transient` | Network errors, exhausted or closed pool |
//! | Decode, ColumnNotFound, ... | N/A | `Transient` | Schema drift while a migration is rolling out |
//!
//! Retry is the default for anything not known to be a constraint or data
//! exception; the queue's attempt limit bounds the cost of that choice.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{instrument, Span};

use statcrunch_core::{
    AggregationQuery, Dimension, DimensionId, EntityStat, HeroId, HeroStats, StatFields, StatsId,
};

use super::r#trait::{StatsStore, StatsTx, StoreError};
use super::sql;
use crate::config::DbConfig;

const DEST_SCHEMA: &str = include_str!("../../schema/dest.sql");

/// Postgres-backed analytics store.
///
/// Holds a small pool; the worker processes one job at a time so a single
/// connection is normally in use.
#[derive(Debug, Clone)]
pub struct PgStatsStore {
    pool: PgPool,
}

impl PgStatsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the analytics database.
    #[instrument(skip_all, fields(host = %config.host, db = %config.database), err)]
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(config.connect_options())
            .await
            .map(Self::new)
            .map_err(|e| map_sqlx_error("connect", e))
    }

    /// Create the analytics tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(DEST_SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StatsStore for PgStatsStore {
    type Tx = PgStatsTx;

    async fn begin(&self) -> Result<PgStatsTx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PgStatsTx { tx })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// An open Postgres transaction.
///
/// `sqlx` rolls the transaction back when this is dropped uncommitted, so a
/// cancelled job never leaks a half-written rollup.
pub struct PgStatsTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StatsTx for PgStatsTx {
    #[instrument(skip(self, id), fields(dimension_id = %id), err)]
    async fn fetch_dimension(&mut self, id: DimensionId) -> Result<Option<Dimension>, StoreError> {
        let row = sqlx::query(sql::SELECT_DIMENSION)
            .bind(id.get())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("fetch_dimension", e))?;

        row.map(|row| dimension_from_row(&row))
            .transpose()
            .map_err(|e| map_sqlx_error("decode_dimension", e))
    }

    #[instrument(
        skip(self, query),
        fields(dimension_id = %query.dimension_id, scope = ?query.scope, rows = tracing::field::Empty),
        err
    )]
    async fn aggregate(&mut self, query: &AggregationQuery) -> Result<Vec<HeroStats>, StoreError> {
        let mut qb = sql::aggregation(query);
        let rows = qb
            .build()
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("aggregate", e))?;

        let stats = rows
            .iter()
            .map(hero_stats_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("decode_aggregate", e))?;

        Span::current().record("rows", stats.len());
        Ok(stats)
    }

    async fn insert_stats(&mut self, fields: &StatFields) -> Result<StatsId, StoreError> {
        let id: i32 = sqlx::query_scalar(sql::INSERT_STATS)
            .bind(fields.win_rate)
            .bind(fields.pick_rate)
            .bind(fields.cs_per_min)
            .bind(fields.gold_per_min)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_stats", e))?;
        Ok(StatsId::new(id))
    }

    async fn insert_entity_stat(&mut self, link: &EntityStat) -> Result<(), StoreError> {
        sqlx::query(sql::INSERT_HERO_STATS)
            .bind(link.entity_id.get())
            .bind(link.dimension_id.get())
            .bind(link.stats_id.get())
            .bind(link.computed_on)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_hero_stats", e))?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn dimension_from_row(row: &PgRow) -> Result<Dimension, sqlx::Error> {
    Ok(Dimension {
        id: DimensionId::new(row.try_get("id")?),
        dimension_on: row.try_get("dimension_on")?,
        name: row.try_get("name")?,
        value: row.try_get("value")?,
    })
}

fn hero_stats_from_row(row: &PgRow) -> Result<HeroStats, sqlx::Error> {
    Ok(HeroStats {
        hero_id: HeroId::new(row.try_get("hero_id")?),
        fields: StatFields {
            win_rate: row.try_get("win_rate")?,
            pick_rate: row.try_get("pick_rate")?,
            cs_per_min: row.try_get("cs_per_min")?,
            gold_per_min: row.try_get("gold_per_min")?,
        },
    })
}

/// Map SQLx errors to `StoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) if is_integrity_violation(code.as_ref()) => StoreError::Constraint(msg),
                Some(code) if is_data_exception(code.as_ref()) => StoreError::Data(msg),
                _ => StoreError::Transient(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Transient(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Transient(format!("timed out acquiring connection in {}", operation))
        }
        _ => StoreError::Transient(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// SQLSTATE class 23: integrity constraint violation.
pub(crate) fn is_integrity_violation(code: &str) -> bool {
    code.starts_with("23")
}

/// SQLSTATE class 22: data exception. Retrying over the same rows fails again.
pub(crate) fn is_data_exception(code: &str) -> bool {
    code.starts_with("22")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_codes() {
        assert!(is_integrity_violation("23505"));
        assert!(is_integrity_violation("23503"));
        assert!(!is_integrity_violation("40P01"));
        assert!(!is_integrity_violation("40001"));
        assert!(!is_integrity_violation("08006"));
    }

    #[test]
    fn data_exception_codes() {
        assert!(is_data_exception("22012"));
        assert!(is_data_exception("22003"));
        assert!(!is_data_exception("23505"));
        assert!(!is_data_exception("40001"));
    }

    #[test]
    fn non_database_errors_are_transient() {
        assert!(matches!(
            map_sqlx_error("begin_transaction", sqlx::Error::PoolTimedOut),
            StoreError::Transient(_)
        ));
        assert!(matches!(
            map_sqlx_error("aggregate", sqlx::Error::RowNotFound),
            StoreError::Transient(_)
        ));
    }
}
