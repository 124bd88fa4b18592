//! Synchronization with the Folio sync server
//!
//! - [`SyncProtocolClient`]: JSON over HTTP with bearer auth and one-shot
//!   token refresh
//! - [`SyncOrchestrator`]: runs push/pull cycles against any
//!   [`SyncTransport`] and commits each cycle atomically
//! - [`SessionStore`]: persisted access/refresh tokens
//!
//! ## Usage
//!
//! ```ignore
//! let session = Arc::new(SessionStore::with_path(config.session_path())?);
//! let client = SyncProtocolClient::from_config(&config, session)?;
//! let orchestrator = SyncOrchestrator::new(store, Arc::new(client));
//! let result = orchestrator.run().await;
//! ```

mod client;
mod error;
mod message;
mod orchestrator;
mod session;
mod transport;

pub use client::SyncProtocolClient;
pub use error::{ApiRetryClass, SyncError};
pub use message::{
    AuthResponse, ConflictInfo, DeltaRequest, DeltaResponse, PullRequest, PullResult,
    PushRequest, PushResult, SyncRecord,
};
pub use orchestrator::{
    SyncEvent, SyncOrchestrator, SyncPhase, SyncProgress, SyncResult, SyncStatus,
};
pub use session::{SessionStore, SessionTokens, TokenProvider, TokenSaver};
pub use transport::SyncTransport;
