//! Dimensions: named, parameterized filter scopes over the match population.

use serde::{Deserialize, Serialize};

use crate::error::{CrunchError, CrunchResult};
use crate::id::DimensionId;

/// A row of `stats_dimensions`, exactly as stored.
///
/// Dimensions are maintained by an administrative process; the cruncher only
/// reads them. `value` is text regardless of the filter's logical type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub id: DimensionId,
    pub dimension_on: String,
    pub name: String,
    pub value: String,
}

impl Dimension {
    pub fn new(
        id: DimensionId,
        dimension_on: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id,
            dimension_on: dimension_on.into(),
            name: name.into(),
            value: value.into(),
        }
    }

    /// Entity the dimension aggregates over.
    pub fn entity(&self) -> CrunchResult<EntityKind> {
        EntityKind::parse(&self.dimension_on)
    }

    /// Filter kind named by the dimension.
    pub fn field(&self) -> FieldName {
        FieldName::parse(&self.name)
    }
}

/// Entities a dimension can be computed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Hero,
}

impl EntityKind {
    /// Anything but `hero` is a configuration gap and fails terminally.
    pub fn parse(raw: &str) -> CrunchResult<Self> {
        match raw {
            "hero" => Ok(EntityKind::Hero),
            other => Err(CrunchError::unsupported(other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Hero => "hero",
        }
    }
}

/// Filter kinds understood for `hero` dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldName {
    Patch,
    RecentMatches,
    SkillTier,
    /// Unknown names aggregate over the whole population.
    Other(String),
}

impl FieldName {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "patch" => FieldName::Patch,
            "recent_matches" => FieldName::RecentMatches,
            "skill_tier" => FieldName::SkillTier,
            other => FieldName::Other(other.to_string()),
        }
    }
}

/// Payload of a `crunch` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrunchPayload {
    pub dimension: DimensionId,
}

impl CrunchPayload {
    pub fn from_json(payload: &serde_json::Value) -> CrunchResult<Self> {
        serde_json::from_value(payload.clone())
            .map_err(|e| CrunchError::invalid_payload(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_hero_entities_are_supported() {
        assert_eq!(EntityKind::parse("hero"), Ok(EntityKind::Hero));
        assert_eq!(
            EntityKind::parse("player"),
            Err(CrunchError::Unsupported("player".to_string()))
        );
    }

    #[test]
    fn payload_parses_dimension_id() {
        let payload = CrunchPayload::from_json(&serde_json::json!({"dimension": "12"})).unwrap();
        assert_eq!(payload.dimension, DimensionId::new(12));

        let err = CrunchPayload::from_json(&serde_json::json!({"dim": 12})).unwrap_err();
        assert!(matches!(err, CrunchError::InvalidPayload(_)));
    }

    #[test]
    fn unknown_field_names_are_kept_verbatim() {
        assert_eq!(
            FieldName::parse("game_mode"),
            FieldName::Other("game_mode".to_string())
        );
    }
}
