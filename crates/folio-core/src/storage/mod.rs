//! Storage layer
//!
//! A single SQLite database holds the three entity tables, the
//! pending-change log and the sync metadata.
//!
//! ## Writers
//!
//! - [`crate::tracker::ChangeTracker`] stamps versions and logs deletes for
//!   local mutations.
//! - [`crate::sync::SyncOrchestrator`] marks rows synced and applies pulled
//!   changes together with the new checkpoint.

pub mod error;
pub mod schema;
pub(crate) mod store;
pub(crate) mod value;

pub use error::{StorageError, StorageResult};
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
pub use store::{ApplyOutcome, CycleCommit, LocalStore, PendingPush};
