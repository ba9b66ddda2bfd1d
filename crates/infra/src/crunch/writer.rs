use chrono::Utc;
use tracing::debug;

use statcrunch_core::{CrunchResult, DimensionId, EntityStat, HeroStats};

use crate::store::StatsTx;

/// Persist one rollup: a `stats` row plus its `hero_stats` link per hero.
///
/// Rows are appended; an earlier rollup of the same dimension is left in
/// place. Each link is stamped with the time it was written.
pub async fn write_rollup<T: StatsTx>(
    tx: &mut T,
    dimension_id: DimensionId,
    rows: &[HeroStats],
) -> CrunchResult<usize> {
    for row in rows {
        let stats_id = tx.insert_stats(&row.fields).await?;
        tx.insert_entity_stat(&EntityStat {
            entity_id: row.hero_id,
            dimension_id,
            stats_id,
            computed_on: Utc::now(),
        })
        .await?;
        debug!(hero_id = %row.hero_id, %stats_id, "stats row written");
    }

    Ok(rows.len())
}
