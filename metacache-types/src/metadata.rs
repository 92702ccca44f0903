//! Schema metadata facts.
//!
//! These are the values written under a global version. They are immutable
//! once stored: a schema change produces a new version with its own copy.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Category the remote system assigns to a data entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EntityCategory {
    Master,
    Transaction,
    Parameters,
    Reference,
    Document,
    #[default]
    Miscellaneous,
}

impl EntityCategory {
    /// All categories, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Master,
        Self::Transaction,
        Self::Parameters,
        Self::Reference,
        Self::Document,
        Self::Miscellaneous,
    ];

    /// Canonical name as used by the remote API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "Master",
            Self::Transaction => "Transaction",
            Self::Parameters => "Parameters",
            Self::Reference => "Reference",
            Self::Document => "Document",
            Self::Miscellaneous => "Miscellaneous",
        }
    }
}

impl fmt::Display for EntityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidValue {
                kind: "entity category",
                value: s.to_string(),
            })
    }
}

/// How an OData action is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BindingKind {
    #[default]
    Unbound,
    BoundToEntityInstance,
    BoundToEntitySet,
}

impl BindingKind {
    pub const ALL: [Self; 3] = [
        Self::Unbound,
        Self::BoundToEntityInstance,
        Self::BoundToEntitySet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unbound => "Unbound",
            Self::BoundToEntityInstance => "BoundToEntityInstance",
            Self::BoundToEntitySet => "BoundToEntitySet",
        }
    }
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BindingKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidValue {
                kind: "binding kind",
                value: s.to_string(),
            })
    }
}

/// A data entity as listed by the remote metadata catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataEntityInfo {
    /// Internal entity name (natural key within a version).
    pub name: String,
    /// Name of the OData public entity, if exposed.
    pub public_entity_name: Option<String>,
    /// Entity set name used in OData URLs.
    pub public_collection_name: Option<String>,
    pub label_id: Option<String>,
    pub label_text: Option<String>,
    pub category: EntityCategory,
    pub data_service_enabled: bool,
    pub data_management_enabled: bool,
    pub is_read_only: bool,
}

impl DataEntityInfo {
    /// Creates an entity with the given name and default flags.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A property of a public entity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityProperty {
    pub name: String,
    pub type_name: String,
    pub data_type: String,
    pub label_id: Option<String>,
    pub label_text: Option<String>,
    pub is_key: bool,
    pub is_mandatory: bool,
    pub allow_edit: bool,
}

/// Return type of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReturnType {
    pub type_name: String,
    pub is_collection: bool,
}

/// A parameter of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionParameter {
    pub name: String,
    pub type_name: String,
    pub is_collection: bool,
}

/// An OData action exposed on a public entity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityAction {
    pub name: String,
    pub binding_kind: BindingKind,
    pub return_type: Option<ActionReturnType>,
    pub parameters: Vec<ActionParameter>,
}

/// Full OData schema of one public entity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PublicEntitySchema {
    pub name: String,
    pub entity_set_name: Option<String>,
    pub label_id: Option<String>,
    pub label_text: Option<String>,
    pub is_read_only: bool,
    pub configuration_enabled: bool,
    /// Properties in declaration order.
    pub properties: Vec<EntityProperty>,
    pub actions: Vec<EntityAction>,
}

impl PublicEntitySchema {
    /// Names of the key properties, in declaration order.
    pub fn key_names(&self) -> Vec<&str> {
        self.properties
            .iter()
            .filter(|p| p.is_key)
            .map(|p| p.name.as_str())
            .collect()
    }
}

/// A member of an enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnumerationMember {
    pub name: String,
    pub value: i64,
    pub label_id: Option<String>,
    pub label_text: Option<String>,
    pub configuration_enabled: bool,
}

/// A public enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Enumeration {
    pub name: String,
    pub label_id: Option<String>,
    pub label_text: Option<String>,
    pub members: Vec<EnumerationMember>,
}
