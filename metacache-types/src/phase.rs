//! Sync phases.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One populate phase of a sync, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Entities,
    PublicEntitySchemas,
    Enumerations,
    Labels,
    SearchIndex,
}

impl SyncPhase {
    /// Every phase, in the order a sync executes them.
    pub const ALL: [Self; 5] = [
        Self::Entities,
        Self::PublicEntitySchemas,
        Self::Enumerations,
        Self::Labels,
        Self::SearchIndex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entities => "entities",
            Self::PublicEntitySchemas => "public_entity_schemas",
            Self::Enumerations => "enumerations",
            Self::Labels => "labels",
            Self::SearchIndex => "search_index",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::InvalidValue {
                kind: "sync phase",
                value: s.to_string(),
            })
    }
}
