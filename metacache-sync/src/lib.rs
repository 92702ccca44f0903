//! Version detection and smart sync for metacache.
//!
//! # Architecture
//!
//! - **Detector**: fingerprints the remote's installed modules
//! - **Source**: the narrow async interface to the remote metadata API
//! - **Engine**: decides what to fetch, populates a global version phase by
//!   phase and binds the environment to it
//! - **Sessions**: run syncs as background tasks with progress, cancellation
//!   and a bounded history
//! - **Query**: read-side facade scoped to an environment's bound version
//!
//! ## Sync Process
//!
//! 1. **Detect**: list installed modules and compute the fingerprint
//! 2. **Decide**: short-circuit when the bound version is already current
//! 3. **Resolve**: get or create the global version for the fingerprint
//! 4. **Populate**: entities, schemas, enumerations, labels, search index
//! 5. **Bind**: point the environment at the version
//!
//! # Example
//!
//! ```no_run
//! use metacache_store::MetadataStore;
//! use metacache_sync::{
//!     CacheConfig, HttpMetadataSource, HttpSourceConfig, NoopProgress, SmartSyncEngine,
//!     SyncRequest,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CacheConfig::default();
//! let store = Arc::new(MetadataStore::open_in_dir(&config.cache_dir)?);
//! let source = Arc::new(HttpMetadataSource::new(HttpSourceConfig::new(
//!     "https://contoso.operations.dynamics.com",
//! ))?);
//! let engine = SmartSyncEngine::new(store, source, "https://contoso.operations.dynamics.com", "contoso", config).await?;
//! let outcome = engine
//!     .sync(&SyncRequest::default(), &CancellationToken::new(), &NoopProgress)
//!     .await?;
//! println!("bound to {}", outcome.global_version_id);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod detector;
mod engine;
mod error;
mod labels;
pub mod progress;
mod query;
mod session;
pub mod source;

pub use config::{CacheConfig, HttpSourceConfig};
pub use engine::{SmartSyncEngine, SyncOutcome, SyncRequest, SyncStrategy};
pub use error::{RemoteError, RemoteResult, SyncError, SyncResult};
pub use labels::{LabelOrigin, LabelResolver, ResolvedLabel};
pub use progress::{ActivityStatus, NoopProgress, PhaseEvent, ProgressSink, SyncActivity};
pub use query::{EntitySearch, Lookup, MetadataQuery};
pub use session::{SessionState, SyncSession, SyncSessionManager};
pub use source::MetadataSource;
pub use source::http::HttpMetadataSource;
pub use source::mock::{MockMetadataSource, MockMethod};
