//! SQLite storage layer for metacache.
//!
//! Provides persistent, version-scoped storage for remote schema metadata.
//!
//! # Architecture
//!
//! - Environments bind to fingerprint-keyed global versions that several
//!   environments can share; bindings are an append-only history
//! - Schema facts (entities, schemas, actions, enumerations) are owned by one
//!   global version and written as idempotent upserts
//! - An FTS5 index is updated in the same transaction as every fact write
//! - Labels carry a TTL and a hit counter; a temporary sentinel version
//!   holds labels cached before a version is established
//! - Schema migrations are additive and applied automatically on open

mod error;
mod label_cache;
mod labels;
mod metadata;
mod migrations;
mod query;
mod search;
mod stats;
mod store;
mod versions;

pub use error::{StoreError, StoreResult};
pub use label_cache::{LabelCache, LabelLookup, SweepReport, DEFAULT_LABEL_TTL};
pub use labels::LabelEntry;
pub use metadata::{ActionFilter, ActionInfo, EntityFilter};
pub use query::{QueryResult, MAX_QUERY_ROWS};
pub use search::{FactKind, SearchHit, SearchQuery, VersionScope};
pub use stats::{EnvironmentStatistics, StoreStatistics, VersionUsage};
pub use store::{MetadataStore, STORE_FILE_NAME};
pub use versions::{AcquiredVersion, Environment, EnvironmentVersion, GlobalVersion};
