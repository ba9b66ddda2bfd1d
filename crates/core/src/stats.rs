//! Rollup rows produced by an aggregation run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{DimensionId, HeroId, StatsId};

/// The four metric columns of a `stats` row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatFields {
    pub win_rate: f64,
    pub pick_rate: f64,
    pub cs_per_min: f64,
    /// Not computed upstream yet; always written as 0.
    pub gold_per_min: f64,
}

impl StatFields {
    /// Rates within `[0, 1]`, per-minute figures finite and non-negative.
    pub fn is_within_bounds(&self) -> bool {
        let rate = |v: f64| (0.0..=1.0).contains(&v);
        let per_min = |v: f64| v.is_finite() && v >= 0.0;
        rate(self.win_rate)
            && rate(self.pick_rate)
            && per_min(self.cs_per_min)
            && per_min(self.gold_per_min)
    }
}

/// One aggregation result: the stats of a single hero within the scope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeroStats {
    pub hero_id: HeroId,
    pub fields: StatFields,
}

/// A persisted `stats` row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatRow {
    pub id: StatsId,
    pub fields: StatFields,
}

/// A `hero_stats` link row tying a stats row to its hero and dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStat {
    pub entity_id: HeroId,
    pub dimension_id: DimensionId,
    pub stats_id: StatsId,
    pub computed_on: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds() {
        let ok = StatFields {
            win_rate: 1.0,
            pick_rate: 0.0,
            cs_per_min: 7.5,
            gold_per_min: 0.0,
        };
        assert!(ok.is_within_bounds());

        let bad = StatFields {
            pick_rate: 1.01,
            ..ok
        };
        assert!(!bad.is_within_bounds());

        let unbounded = StatFields {
            cs_per_min: f64::INFINITY,
            ..ok
        };
        assert!(!unbounded.is_within_bounds());
        let nan = StatFields {
            gold_per_min: f64::NAN,
            ..ok
        };
        assert!(!nan.is_within_bounds());
    }
}
