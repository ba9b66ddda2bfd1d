use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, instrument, warn, Span};

use statcrunch_core::{AggregationQuery, CrunchError, CrunchPayload, CrunchResult};

use super::{resolver, writer};
use crate::jobs::{JobFailure, JobId, Worker};
use crate::store::{StatsStore, StatsTx};

/// Where the current job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrunchState {
    Idle,
    TransactionOpen,
    DimensionResolved,
    Aggregated,
    Written,
    Committed,
    RolledBack,
}

/// Worker that turns `crunch` jobs into stats rollups.
///
/// Owns the transaction of the job in flight from `windup` to `teardown`.
/// Dropping the cruncher mid-job drops the transaction, which rolls it back.
pub struct Cruncher<S: StatsStore> {
    store: S,
    job_type: String,
    tx: Option<S::Tx>,
    state: CrunchState,
}

impl<S: StatsStore> Cruncher<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            job_type: "crunch".to_string(),
            tx: None,
            state: CrunchState::Idle,
        }
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = job_type.into();
        self
    }

    pub fn state(&self) -> CrunchState {
        self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resolve, aggregate and write inside the open transaction.
    ///
    /// Returns the number of rollup rows written.
    #[instrument(
        skip(self, payload),
        fields(dimension_id = tracing::field::Empty, rows = tracing::field::Empty),
        err
    )]
    pub async fn crunch(&mut self, payload: &Value) -> CrunchResult<usize> {
        let payload = CrunchPayload::from_json(payload)?;
        Span::current().record("dimension_id", payload.dimension.get());

        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| CrunchError::transient("no open transaction"))?;

        let dimension = resolver::resolve(tx, payload.dimension).await?;
        self.state = CrunchState::DimensionResolved;

        // Built before any query runs: a bad value never reaches the store.
        let query = AggregationQuery::build(&dimension)?;
        let rows = tx.aggregate(&query).await?;
        self.state = CrunchState::Aggregated;

        let written = writer::write_rollup(tx, dimension.id, &rows).await?;
        self.state = CrunchState::Written;

        Span::current().record("rows", written);
        Ok(written)
    }

    async fn rollback_open(&mut self) -> Result<(), CrunchError> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        self.state = CrunchState::RolledBack;
        tx.rollback().await.map_err(CrunchError::from)
    }
}

#[async_trait]
impl<S: StatsStore> Worker for Cruncher<S> {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn windup(&mut self) -> Result<(), JobFailure> {
        if self.tx.is_some() {
            warn!("rolling back transaction left open by a previous job");
            if let Err(e) = self.rollback_open().await {
                warn!(error = %e, "stale rollback failed");
            }
        }

        let tx = self.store.begin().await.map_err(CrunchError::from)?;
        self.tx = Some(tx);
        self.state = CrunchState::TransactionOpen;
        Ok(())
    }

    async fn execute_job(
        &mut self,
        job_id: JobId,
        payload: &Value,
        _priority: i32,
    ) -> Result<(), JobFailure> {
        match self.crunch(payload).await {
            Ok(rows) => {
                info!(%job_id, rows, "rollup computed");
                Ok(())
            }
            Err(e) if e.is_terminal() => {
                error!(%job_id, error = %e, "crunch failed permanently");
                Err(e.into())
            }
            Err(e) => {
                warn!(%job_id, error = %e, "crunch failed");
                Err(e.into())
            }
        }
    }

    async fn teardown(&mut self, failed: bool) -> Result<(), JobFailure> {
        if failed {
            return Ok(self.rollback_open().await?);
        }

        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        match tx.commit().await {
            Ok(()) => {
                self.state = CrunchState::Committed;
                Ok(())
            }
            Err(e) => {
                self.state = CrunchState::RolledBack;
                Err(CrunchError::from(e).into())
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.rollback_open().await {
            warn!(error = %e, "rollback on shutdown failed");
        }
        self.store.close().await;
    }
}
