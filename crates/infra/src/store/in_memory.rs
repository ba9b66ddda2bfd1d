//! In-memory analytics store.
//!
//! Intended for tests/dev. Evaluates aggregations with the same semantics as
//! the SQL in [`super::sql`], including its quirks (the pick rate denominator
//! ignores the scope; cs/min sums every participation but divides by those
//! with farm data).

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use statcrunch_core::{
    AggregationQuery, Dimension, DimensionId, EntityStat, HeroId, HeroStats, Scope, StatFields,
    StatRow, StatsId,
};

use super::r#trait::{StatsStore, StatsTx, StoreError};

/// A `match` row.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRow {
    pub api_id: String,
    pub patch_version: String,
    /// Match length in seconds.
    pub duration: i32,
    pub created_at: DateTime<Utc>,
}

/// A `participant` row.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantRow {
    pub api_id: String,
    pub roster_api_id: String,
    pub hero: String,
    pub winner: bool,
    pub minion_kills: i32,
    pub farm: Option<f64>,
    pub skill_tier: Option<i32>,
}

/// One-shot failure injected into the next matching store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreFault {
    Begin(StoreError),
    Aggregate(StoreError),
    /// Fail the `nth` (0-based) `stats` insert of a transaction.
    InsertStats { nth: usize, error: StoreError },
    /// Fail the `nth` (0-based) `hero_stats` insert of a transaction.
    InsertEntityStat { nth: usize, error: StoreError },
    Commit(StoreError),
}

#[derive(Debug, Clone, Default)]
struct Tables {
    dimensions: BTreeMap<DimensionId, Dimension>,
    matches: Vec<MatchRow>,
    rosters: BTreeMap<String, String>,
    participants: Vec<ParticipantRow>,
    participant_stats: HashSet<String>,
    heroes: BTreeMap<HeroId, String>,
    stats: Vec<StatRow>,
    hero_stats: Vec<EntityStat>,
    next_dimension_id: i32,
    next_hero_id: i32,
    next_stats_id: i32,
}

impl Tables {
    fn next_id(counter: &mut i32) -> i32 {
        *counter += 1;
        *counter
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: Tables,
    faults: Vec<StoreFault>,
    aggregations_run: usize,
    open_transactions: usize,
    closed: bool,
}

impl Shared {
    fn take_fault(&mut self, pick: impl Fn(&StoreFault) -> bool) -> Option<StoreFault> {
        let idx = self.faults.iter().position(pick)?;
        Some(self.faults.remove(idx))
    }
}

/// In-memory analytics store.
///
/// Transactions work on a private copy of the tables taken at `begin` and
/// publish it on `commit`. Only one transaction is expected to be open at a
/// time, matching the one-job-in-flight worker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStatsStore {
    shared: Arc<Mutex<Shared>>,
}

impl InMemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_dimension(
        &self,
        dimension_on: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> DimensionId {
        let mut shared = self.shared();
        let tables = &mut shared.tables;
        let id = DimensionId::new(Tables::next_id(&mut tables.next_dimension_id));
        tables
            .dimensions
            .insert(id, Dimension::new(id, dimension_on, name, value));
        id
    }

    pub fn add_hero(&self, api_name: impl Into<String>) -> HeroId {
        let mut shared = self.shared();
        let tables = &mut shared.tables;
        let id = HeroId::new(Tables::next_id(&mut tables.next_hero_id));
        tables.heroes.insert(id, api_name.into());
        id
    }

    pub fn add_match(&self, row: MatchRow) {
        self.shared().tables.matches.push(row);
    }

    pub fn add_roster(&self, api_id: impl Into<String>, match_api_id: impl Into<String>) {
        self.shared()
            .tables
            .rosters
            .insert(api_id.into(), match_api_id.into());
    }

    /// Add a participant together with its `participant_stats` row.
    pub fn add_participant(&self, row: ParticipantRow) {
        let mut shared = self.shared();
        shared
            .tables
            .participant_stats
            .insert(row.api_id.clone());
        shared.tables.participants.push(row);
    }

    /// Add a participant whose detailed stats were never ingested.
    pub fn add_participant_without_stats(&self, row: ParticipantRow) {
        self.shared().tables.participants.push(row);
    }

    pub fn inject(&self, fault: StoreFault) {
        self.shared().faults.push(fault);
    }

    /// Committed `stats` rows.
    pub fn stats_rows(&self) -> Vec<StatRow> {
        self.shared().tables.stats.clone()
    }

    /// Committed `hero_stats` rows.
    pub fn entity_stats(&self) -> Vec<EntityStat> {
        self.shared().tables.hero_stats.clone()
    }

    /// Number of aggregation queries executed so far.
    pub fn aggregations_run(&self) -> usize {
        self.shared().aggregations_run
    }

    /// Transactions begun and not yet committed, rolled back or dropped.
    pub fn open_transactions(&self) -> usize {
        self.shared().open_transactions
    }
}

#[async_trait]
impl StatsStore for InMemoryStatsStore {
    type Tx = InMemoryStatsTx;

    async fn begin(&self) -> Result<InMemoryStatsTx, StoreError> {
        let mut shared = self.shared();
        if shared.closed {
            return Err(StoreError::Transient("store closed".to_string()));
        }
        if let Some(StoreFault::Begin(err)) =
            shared.take_fault(|f| matches!(f, StoreFault::Begin(_)))
        {
            return Err(err);
        }

        shared.open_transactions += 1;
        Ok(InMemoryStatsTx {
            shared: self.shared.clone(),
            working: shared.tables.clone(),
            stats_inserted: 0,
            links_inserted: 0,
            finished: false,
        })
    }

    async fn close(&self) {
        self.shared().closed = true;
    }
}

/// Transaction over [`InMemoryStatsStore`].
#[derive(Debug)]
pub struct InMemoryStatsTx {
    shared: Arc<Mutex<Shared>>,
    working: Tables,
    stats_inserted: usize,
    links_inserted: usize,
    finished: bool,
}

impl InMemoryStatsTx {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            let mut shared = self.shared();
            shared.open_transactions = shared.open_transactions.saturating_sub(1);
        }
    }
}

impl Drop for InMemoryStatsTx {
    fn drop(&mut self) {
        self.finish();
    }
}

#[async_trait]
impl StatsTx for InMemoryStatsTx {
    async fn fetch_dimension(&mut self, id: DimensionId) -> Result<Option<Dimension>, StoreError> {
        Ok(self.working.dimensions.get(&id).cloned())
    }

    async fn aggregate(&mut self, query: &AggregationQuery) -> Result<Vec<HeroStats>, StoreError> {
        {
            let mut shared = self.shared();
            if let Some(StoreFault::Aggregate(err)) =
                shared.take_fault(|f| matches!(f, StoreFault::Aggregate(_)))
            {
                return Err(err);
            }
            shared.aggregations_run += 1;
        }
        Ok(evaluate(&self.working, &query.scope))
    }

    async fn insert_stats(&mut self, fields: &StatFields) -> Result<StatsId, StoreError> {
        let nth = self.stats_inserted;
        if let Some(StoreFault::InsertStats { error, .. }) = self
            .shared()
            .take_fault(|f| matches!(f, StoreFault::InsertStats { nth: n, .. } if *n == nth))
        {
            return Err(error);
        }

        let id = StatsId::new(Tables::next_id(&mut self.working.next_stats_id));
        self.working.stats.push(StatRow {
            id,
            fields: *fields,
        });
        self.stats_inserted += 1;
        Ok(id)
    }

    async fn insert_entity_stat(&mut self, link: &EntityStat) -> Result<(), StoreError> {
        let nth = self.links_inserted;
        if let Some(StoreFault::InsertEntityStat { error, .. }) = self
            .shared()
            .take_fault(|f| matches!(f, StoreFault::InsertEntityStat { nth: n, .. } if *n == nth))
        {
            return Err(error);
        }

        let tables = &self.working;
        if !tables.heroes.contains_key(&link.entity_id)
            || !tables.dimensions.contains_key(&link.dimension_id)
            || !tables.stats.iter().any(|s| s.id == link.stats_id)
        {
            return Err(StoreError::Constraint(format!(
                "hero_stats foreign key violation: {link:?}"
            )));
        }

        self.working.hero_stats.push(*link);
        self.links_inserted += 1;
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        let working = std::mem::take(&mut self.working);
        {
            let mut shared = self.shared();
            if let Some(StoreFault::Commit(err)) =
                shared.take_fault(|f| matches!(f, StoreFault::Commit(_)))
            {
                return Err(err);
            }
            shared.tables = working;
        }
        self.finish();
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        self.finish();
        Ok(())
    }
}

/// Joined `participant × participant_stats × roster × match × heros` row.
struct Participation<'a> {
    hero_id: HeroId,
    participant: &'a ParticipantRow,
    game: &'a MatchRow,
}

fn evaluate(tables: &Tables, scope: &Scope) -> Vec<HeroStats> {
    let hero_ids: BTreeMap<&str, HeroId> = tables
        .heroes
        .iter()
        .map(|(id, name)| (name.as_str(), *id))
        .collect();
    let matches: BTreeMap<&str, &MatchRow> = tables
        .matches
        .iter()
        .map(|m| (m.api_id.as_str(), m))
        .collect();

    let recent: Option<HashSet<&str>> = match scope {
        Scope::RecentMatches(n) => {
            // Equal timestamps fall back to api_id, not insertion order:
            // the match table records no arrival sequence.
            let mut ordered: Vec<&MatchRow> = tables.matches.iter().collect();
            ordered.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| b.api_id.cmp(&a.api_id))
            });
            let take = usize::try_from(*n).unwrap_or(usize::MAX);
            Some(ordered.iter().take(take).map(|m| m.api_id.as_str()).collect())
        }
        _ => None,
    };

    let in_scope = |p: &Participation<'_>| match scope {
        Scope::Everything => true,
        Scope::Patch(version) => &p.game.patch_version == version,
        Scope::RecentMatches(_) => recent
            .as_ref()
            .is_some_and(|ids| ids.contains(p.game.api_id.as_str())),
        Scope::SkillTier(tier) => p.participant.skill_tier == Some(*tier),
    };

    let joined = tables.participants.iter().filter_map(|participant| {
        if !tables.participant_stats.contains(&participant.api_id) {
            return None;
        }
        let match_api_id = tables.rosters.get(&participant.roster_api_id)?;
        let game = *matches.get(match_api_id.as_str())?;
        let hero_id = *hero_ids.get(participant.hero.as_str())?;
        Some(Participation {
            hero_id,
            participant,
            game,
        })
    });

    #[derive(Default)]
    struct Acc {
        participations: u64,
        wins: u64,
        cs_sum: f64,
        with_farm: u64,
    }

    let mut groups: BTreeMap<HeroId, Acc> = BTreeMap::new();
    for p in joined.filter(|p| in_scope(p)) {
        let acc = groups.entry(p.hero_id).or_default();
        acc.participations += 1;
        if p.participant.winner {
            acc.wins += 1;
        }
        // Zero-length matches contribute nothing to the sum (NULL in SQL).
        if p.game.duration != 0 {
            acc.cs_sum +=
                60.0 * f64::from(p.participant.minion_kills) / f64::from(p.game.duration);
        }
        if p.participant.farm.is_some() {
            acc.with_farm += 1;
        }
    }

    let total_picks = tables.participants.len() as f64;
    let ratio = |num: f64, den: u64| if den == 0 { 0.0 } else { num / den as f64 };

    groups
        .into_iter()
        .map(|(hero_id, acc)| HeroStats {
            hero_id,
            fields: StatFields {
                win_rate: ratio(acc.wins as f64, acc.participations),
                pick_rate: acc.participations as f64 / total_picks,
                cs_per_min: ratio(acc.cs_sum, acc.with_farm),
                gold_per_min: 0.0,
            },
        })
        .collect()
}
