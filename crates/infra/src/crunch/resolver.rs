use statcrunch_core::{CrunchError, CrunchResult, Dimension, DimensionId};

use crate::store::StatsTx;

/// Load the dimension a job refers to.
///
/// A missing row is terminal: retrying cannot make it appear.
pub async fn resolve<T: StatsTx>(tx: &mut T, id: DimensionId) -> CrunchResult<Dimension> {
    tx.fetch_dimension(id)
        .await?
        .ok_or(CrunchError::NotFound(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStatsStore, StatsStore};

    #[tokio::test]
    async fn resolves_stored_dimension() {
        let store = InMemoryStatsStore::new();
        let id = store.add_dimension("hero", "patch", "2.1");

        let mut tx = store.begin().await.unwrap();
        let dimension = resolve(&mut tx, id).await.unwrap();

        assert_eq!(dimension, Dimension::new(id, "hero", "patch", "2.1"));
    }

    #[tokio::test]
    async fn missing_dimension_is_not_found() {
        let store = InMemoryStatsStore::new();

        let mut tx = store.begin().await.unwrap();
        let err = resolve(&mut tx, DimensionId::new(404)).await.unwrap_err();

        assert_eq!(err, CrunchError::NotFound(DimensionId::new(404)));
        assert!(err.is_terminal());
    }
}
