//! Aggregation queries: which population a rollup is computed over.
//!
//! A [`Dimension`] is resolved into a closed [`Scope`] variant. Operands are
//! validated and typed here so that storage backends only ever see typed
//! values they can bind as parameters, never text to splice into SQL.

use serde::{Deserialize, Serialize};

use crate::dimension::{Dimension, EntityKind, FieldName};
use crate::error::{CrunchError, CrunchResult};
use crate::id::DimensionId;

/// Population predicate of one aggregation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "operand", rename_all = "snake_case")]
pub enum Scope {
    /// No predicate: every participation counts.
    Everything,
    /// Matches played on exactly this patch version.
    Patch(String),
    /// The N most recently created matches.
    RecentMatches(i64),
    /// Participants at this skill tier.
    SkillTier(i32),
}

impl Scope {
    /// Derive the scope of a `hero` dimension from its filter name and value.
    pub fn for_hero(dimension: &Dimension) -> CrunchResult<Self> {
        match dimension.field() {
            FieldName::Patch => Ok(Scope::Patch(dimension.value.clone())),
            FieldName::RecentMatches => {
                parse_match_count(&dimension.name, &dimension.value).map(Scope::RecentMatches)
            }
            FieldName::SkillTier => {
                parse_skill_tier(&dimension.name, &dimension.value).map(Scope::SkillTier)
            }
            // Mirrors the historical behaviour: an unrecognised filter name
            // silently widens the rollup to the whole population.
            FieldName::Other(_) => Ok(Scope::Everything),
        }
    }
}

/// Fully resolved aggregation over one dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationQuery {
    pub dimension_id: DimensionId,
    pub entity: EntityKind,
    pub scope: Scope,
}

impl AggregationQuery {
    /// Build the aggregation for a dimension.
    ///
    /// Fails terminally for unsupported entities and malformed operands.
    pub fn build(dimension: &Dimension) -> CrunchResult<Self> {
        let entity = dimension.entity()?;
        let scope = match entity {
            EntityKind::Hero => Scope::for_hero(dimension)?,
        };

        Ok(Self {
            dimension_id: dimension.id,
            entity,
            scope,
        })
    }
}

fn parse_match_count(name: &str, value: &str) -> CrunchResult<i64> {
    let n: i64 = value
        .parse()
        .map_err(|_| CrunchError::invalid_value(name, value, "expected a positive integer"))?;
    if n <= 0 {
        return Err(CrunchError::invalid_value(
            name,
            value,
            "expected a positive integer",
        ));
    }
    Ok(n)
}

fn parse_skill_tier(name: &str, value: &str) -> CrunchResult<i32> {
    value
        .parse()
        .map_err(|_| CrunchError::invalid_value(name, value, "expected an integer skill tier"))
}
