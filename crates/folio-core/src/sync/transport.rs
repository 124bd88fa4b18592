//! The orchestrator's view of the sync server

use async_trait::async_trait;

use super::error::SyncError;
use super::message::{DeltaResponse, PullResult, PushResult, SyncRecord};
use crate::models::Checkpoint;

/// Push/pull operations against a sync server
///
/// `batch_size = None` lets the implementation use its configured default.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// True when a credential is available for authenticated calls
    fn has_credentials(&self) -> bool;

    async fn push(&self, records: Vec<SyncRecord>) -> Result<PushResult, SyncError>;

    async fn pull(
        &self,
        checkpoint: Option<Checkpoint>,
        batch_size: Option<u32>,
    ) -> Result<PullResult, SyncError>;

    /// Push `records` (if any) and pull the first page in one round trip
    async fn delta(
        &self,
        records: Vec<SyncRecord>,
        checkpoint: Option<Checkpoint>,
        batch_size: Option<u32>,
    ) -> Result<DeltaResponse, SyncError>;
}
