//! Folio Core Library
//!
//! This crate provides the core functionality for Folio, an offline-first
//! portfolio tracker that syncs with a remote server.
//!
//! # Architecture
//!
//! - **SQLite**: source of truth on the device; every local edit marks the row
//!   dirty and is synced later
//! - **Pending-change log**: records deletes (and pending creates/updates) so
//!   removals can be replayed to the server
//! - **Checkpointed sync**: push dirty rows, pull remote changes page by page,
//!   then commit everything plus the new checkpoint in one transaction
//!
//! # Quick Start
//!
//! ```text
//! let store = Arc::new(LocalStore::open(&config)?);
//! let tracker = ChangeTracker::new(store.clone());
//!
//! // Add a portfolio
//! let portfolio = Portfolio::new("Retirement");
//! tracker.create(&portfolio)?;
//!
//! // Query portfolios
//! let portfolios: Vec<Portfolio> = store.list_as()?;
//! ```
//!
//! # Modules
//!
//! - `storage`: SQLite schema and `LocalStore`
//! - `tracker`: versioning and change log for local mutations
//! - `mapper`: local/wire field naming
//! - `sync`: HTTP client, sessions and the sync orchestrator
//! - `models`: portfolios, entries and payments
//! - `config`: Application configuration

pub mod config;
pub mod mapper;
pub mod models;
pub mod storage;
pub mod sync;
pub mod tracker;

pub use config::Config;
pub use mapper::{FieldMapper, ProtocolVersion, MAPPER_VERSION};
pub use models::{
    AssetType, ChangeOperation, Checkpoint, Entry, LocalPatch, LocalRecord, Payment,
    PendingChange, Portfolio, RowKey, SyncEntity, SyncTable, SyncedKey,
};
pub use storage::{ApplyOutcome, LocalStore, StorageError, StorageResult};
pub use sync::{SyncError, SyncOrchestrator, SyncResult};
pub use tracker::ChangeTracker;
