//! Core type definitions for metacache.
//!
//! This crate defines the plain value types shared by the store, the sync
//! engine and the serving layer:
//! - Environment, global version and sync session identifiers
//! - Version fingerprints and installed module records
//! - Schema metadata facts (data entities, public entity schemas, actions,
//!   enumerations)
//! - The closed set of sync phases
//!
//! Nothing here performs I/O.

mod ids;
mod metadata;
mod module;
mod phase;

pub use ids::{EnvironmentId, GlobalVersionId, SessionId};
pub use metadata::{
    ActionParameter, ActionReturnType, BindingKind, DataEntityInfo, EntityAction, EntityCategory,
    EntityProperty, Enumeration, EnumerationMember, PublicEntitySchema,
};
pub use module::{Fingerprint, ModuleVersion};
pub use phase::SyncPhase;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid {kind}: {value}")]
    InvalidValue { kind: &'static str, value: String },
}
