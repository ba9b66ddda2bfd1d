//! SQL rendering of aggregation queries.
//!
//! Scope operands only ever enter the statement through
//! [`QueryBuilder::push_bind`]; the text pushed around them is static.

use sqlx::{Postgres, QueryBuilder};

use statcrunch_core::{AggregationQuery, EntityKind, Scope};

const HERO_AGGREGATION: &str = r#"
SELECT
    heros.id AS hero_id,
    COALESCE(
        SUM(participant.winner::INT) / NULLIF(COUNT(participant.winner), 0)::FLOAT8,
        0
    ) AS win_rate,
    COUNT(participant.hero) / NULLIF((SELECT COUNT(hero) FROM participant), 0)::FLOAT8 AS pick_rate,
    COALESCE(
        SUM(60 * participant.minion_kills / NULLIF(match.duration, 0)::FLOAT8)
            / NULLIF(COUNT(participant.farm), 0)::FLOAT8,
        0
    ) AS cs_per_min,
    0::FLOAT8 AS gold_per_min
FROM participant
JOIN participant_stats ON participant.api_id = participant_stats.participant_api_id
JOIN roster ON roster.api_id = participant.roster_api_id
JOIN match ON match.api_id = roster.match_api_id
JOIN heros ON heros.api_name = participant.hero
"#;

/// Render the aggregation statement for `query` with its operands bound.
pub fn aggregation(query: &AggregationQuery) -> QueryBuilder<'static, Postgres> {
    let mut qb = match query.entity {
        EntityKind::Hero => QueryBuilder::new(HERO_AGGREGATION),
    };

    match &query.scope {
        Scope::Everything => {}
        Scope::Patch(version) => {
            qb.push("WHERE match.patch_version = ");
            qb.push_bind(version.clone());
        }
        Scope::RecentMatches(n) => {
            // Ties on created_at break by api_id; arrival order is not stored.
            qb.push(
                "WHERE match.api_id IN (SELECT api_id FROM match ORDER BY created_at DESC, api_id DESC LIMIT ",
            );
            qb.push_bind(*n);
            qb.push(")");
        }
        Scope::SkillTier(tier) => {
            qb.push("WHERE participant.skill_tier = ");
            qb.push_bind(*tier);
        }
    }

    qb.push("\nGROUP BY heros.id\nORDER BY heros.id");
    qb
}

pub(crate) const SELECT_DIMENSION: &str = r#"
SELECT id, dimension_on, name, value
FROM stats_dimensions
WHERE id = $1
"#;

pub(crate) const INSERT_STATS: &str = r#"
INSERT INTO stats (win_rate, pick_rate, cs_per_min, gold_per_min)
VALUES ($1, $2, $3, $4)
RETURNING id
"#;

pub(crate) const INSERT_HERO_STATS: &str = r#"
INSERT INTO hero_stats (hero_id, dimension_id, stats_id, computed_on)
VALUES ($1, $2, $3, $4)
"#;
