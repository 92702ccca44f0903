//! Installed module records and the fingerprint derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One installed schema-defining module as reported by the remote system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleVersion {
    pub name: String,
    pub version: String,
    pub module: Option<String>,
    pub publisher: Option<String>,
    pub display_name: Option<String>,
}

impl ModuleVersion {
    /// Creates a record carrying only a name and a version.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            module: None,
            publisher: None,
            display_name: None,
        }
    }
}

/// Stable hash identifying a remote schema version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps an already computed fingerprint string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First twelve characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(12).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}
