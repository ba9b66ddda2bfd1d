//! Strongly-typed identifiers of destination store rows.
//!
//! All of them wrap the `SERIAL` primary keys of the analytics schema.

use core::str::FromStr;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::CrunchError;

/// Identifier of a row in `stats_dimensions`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DimensionId(i32);

/// Identifier of a row in `stats`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatsId(i32);

/// Identifier of a row in `heros`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeroId(i32);

macro_rules! impl_serial_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            pub const fn new(value: i32) -> Self {
                Self(value)
            }

            pub const fn get(&self) -> i32 {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i32> for $t {
            fn from(value: i32) -> Self {
                Self(value)
            }
        }

        impl From<$t> for i32 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = CrunchError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let id = i32::from_str(s)
                    .map_err(|e| CrunchError::invalid_payload(format!("{}: {}", $name, e)))?;
                Ok(Self(id))
            }
        }
    };
}

impl_serial_newtype!(DimensionId, "DimensionId");
impl_serial_newtype!(StatsId, "StatsId");
impl_serial_newtype!(HeroId, "HeroId");

/// Job payloads written by different producers carry the dimension id either
/// as a JSON number or as a numeric string; both are accepted.
impl<'de> Deserialize<'de> for DimensionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
