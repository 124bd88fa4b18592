//! Sync cycle orchestration
//!
//! One cycle runs through these phases:
//!
//! 1. Authenticating: bail out early without a credential
//! 2. Pushing: dirty rows and delete-log entries go out in one delta request
//! 3. Pulling: pages are fetched until `has_more` is false, without applying
//! 4. Applying: pulled records are mapped and de-duplicated
//! 5. Committing: acknowledgements, pulled rows and the new checkpoint are
//!    written in one transaction
//!
//! Nothing is persisted before the commit, so a failed cycle leaves local
//! state exactly as it was.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use super::error::{ApiRetryClass, SyncError};
use super::message::{ConflictInfo, PullResult, SyncRecord};
use super::transport::SyncTransport;
use crate::mapper::FieldMapper;
use crate::models::{Checkpoint, LocalPatch, RowKey, SyncTable, SyncedKey};
use crate::storage::{CycleCommit, LocalStore};

/// Where the orchestrator is in the current cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Authenticating,
    Pushing,
    Pulling,
    Applying,
    Committing,
    /// The last cycle failed; followed by `Idle`
    Error,
}

/// Cumulative counters published while a cycle runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncProgress {
    pub pushed: usize,
    pub pulled: usize,
    pub has_more: bool,
}

/// Events emitted by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    PhaseChanged(SyncPhase),
    Progress(SyncProgress),
    Error(String),
}

/// Outcome of one sync cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub error: Option<String>,
    /// Records the server accepted
    pub pushed: usize,
    /// Records received from the server
    pub pulled: usize,
    /// Records the server rejected; they stay dirty unless the pull carries
    /// the server's version
    pub conflicts: usize,
    pub synced_at: Option<i64>,
    /// How the failure should be handled; unset on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<ApiRetryClass>,
}

impl SyncResult {
    fn failed(error: &SyncError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            retry: Some(error.retry_class()),
            ..Self::default()
        }
    }
}

/// Snapshot of local sync state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub authenticated: bool,
    pub phase: SyncPhase,
    pub last_sync_at: Option<i64>,
    pub pending_changes: usize,
    pub checkpoint: Option<Checkpoint>,
}

/// A pushed record and the key/version to acknowledge if accepted
struct Outgoing {
    record: SyncRecord,
    ack: SyncedKey,
}

/// Drives push/pull cycles between the local store and a sync server
pub struct SyncOrchestrator {
    store: Arc<LocalStore>,
    transport: Arc<dyn SyncTransport>,
    mapper: FieldMapper,
    batch_size: Option<u32>,
    /// Held for the duration of a cycle
    running: Mutex<()>,
    phase: watch::Sender<SyncPhase>,
    phase_rx: watch::Receiver<SyncPhase>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

/// Events buffered for a slow or absent reader before new ones are dropped
const EVENT_BUFFER: usize = 64;

impl SyncOrchestrator {
    pub fn new(store: Arc<LocalStore>, transport: Arc<dyn SyncTransport>) -> Self {
        let (phase_tx, phase_rx) = watch::channel(SyncPhase::Idle);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

        Self {
            store,
            transport,
            mapper: FieldMapper::default(),
            batch_size: None,
            running: Mutex::new(()),
            phase: phase_tx,
            phase_rx,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn with_mapper(mut self, mapper: FieldMapper) -> Self {
        self.mapper = mapper;
        self
    }

    /// Page size for pulls (the transport's default otherwise)
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Get the current phase
    pub fn phase(&self) -> SyncPhase {
        *self.phase_rx.borrow()
    }

    /// Subscribe to phase changes
    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase_rx.clone()
    }

    /// Take the event receiver (can only be called once)
    ///
    /// Events are observational: once `EVENT_BUFFER` events are waiting,
    /// newer ones are dropped.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    fn set_phase(&self, phase: SyncPhase) {
        let _ = self.phase.send(phase);
        self.emit(SyncEvent::PhaseChanged(phase));
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.event_tx.try_send(event) {
            debug!(?event, "event buffer full, dropping event");
        }
    }

    /// Current authentication, checkpoint and pending-change state
    pub fn status(&self) -> Result<SyncStatus, SyncError> {
        Ok(SyncStatus {
            authenticated: self.transport.has_credentials(),
            phase: self.phase(),
            last_sync_at: self.store.last_sync_at()?,
            pending_changes: self.store.pending_change_count()?,
            checkpoint: self.store.checkpoint()?,
        })
    }

    /// Run one sync cycle
    ///
    /// Errors never escape; they are reported through the returned result.
    /// A call made while another cycle is running is refused immediately.
    pub async fn run(&self) -> SyncResult {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("Sync already running, refusing concurrent run");
            return SyncResult::failed(&SyncError::AlreadyRunning);
        };

        info!("Starting sync cycle");
        match self.run_cycle().await {
            Ok(result) => {
                self.set_phase(SyncPhase::Idle);
                info!(
                    pushed = result.pushed,
                    pulled = result.pulled,
                    conflicts = result.conflicts,
                    "Sync complete"
                );
                result
            }
            Err(e) => {
                warn!("Sync failed: {}", e);
                self.set_phase(SyncPhase::Error);
                self.emit(SyncEvent::Error(e.to_string()));
                self.set_phase(SyncPhase::Idle);
                SyncResult::failed(&e)
            }
        }
    }

    async fn run_cycle(&self) -> Result<SyncResult, SyncError> {
        self.set_phase(SyncPhase::Authenticating);
        if !self.transport.has_credentials() {
            return Err(SyncError::NotAuthenticated);
        }

        // Push
        self.set_phase(SyncPhase::Pushing);
        let outgoing = self.outgoing()?;
        let records: Vec<SyncRecord> = outgoing.iter().map(|o| o.record.clone()).collect();
        let checkpoint = self.store.checkpoint()?;
        debug!(records = records.len(), "Pushing local changes");

        let response = self
            .transport
            .delta(records.clone(), checkpoint.clone(), self.batch_size)
            .await?;

        let push_result = match response.push {
            Some(result) => Some(result),
            None if !records.is_empty() => {
                debug!("Delta response had no push result, pushing separately");
                Some(self.transport.push(records).await?)
            }
            None => None,
        };

        let (synced, conflicted) = match push_result {
            Some(result) => self.acknowledged(outgoing, &result.conflicts),
            None => (Vec::new(), Vec::new()),
        };
        let conflicts = conflicted.len();
        let pushed = synced.len();

        // Pull
        self.set_phase(SyncPhase::Pulling);
        let first_page = match response.pull {
            Some(page) => page,
            None => {
                self.transport
                    .pull(checkpoint.clone(), self.batch_size)
                    .await?
            }
        };
        self.emit(SyncEvent::Progress(SyncProgress {
            pushed,
            pulled: 0,
            has_more: first_page.has_more,
        }));

        let (pulled, new_checkpoint) = self.pull_all(first_page, checkpoint, pushed).await?;
        let pulled_count = pulled.len();

        // Apply
        self.set_phase(SyncPhase::Applying);
        let (upserts, deletes) = self.prepare(pulled);

        // Commit
        self.set_phase(SyncPhase::Committing);
        let synced_at = Utc::now().timestamp();
        let outcome = self.store.commit_cycle(&CycleCommit {
            synced,
            conflicted,
            upserts,
            deletes,
            checkpoint: new_checkpoint,
            synced_at,
        })?;
        debug!(
            applied = outcome.applied,
            deleted = outcome.deleted,
            skipped = outcome.skipped,
            "Committed sync cycle"
        );

        Ok(SyncResult {
            success: true,
            error: None,
            pushed,
            pulled: pulled_count,
            conflicts,
            synced_at: Some(synced_at),
            retry: None,
        })
    }

    /// Dirty rows (parents first) followed by delete tombstones
    fn outgoing(&self) -> Result<Vec<Outgoing>, SyncError> {
        let pending = self.store.pending_push()?;
        let mut outgoing = Vec::with_capacity(pending.len());

        for record in &pending.records {
            outgoing.push(Outgoing {
                record: self.mapper.to_wire(record),
                ack: SyncedKey {
                    key: record.key(),
                    version: record.sync_version,
                },
            });
        }

        for change in &pending.deletes {
            let Some(table) = SyncTable::from_name(&change.table_name) else {
                warn!(table = %change.table_name, row_id = %change.row_id, "skipping delete for unknown table");
                continue;
            };
            outgoing.push(Outgoing {
                record: self.mapper.delete_to_wire(change),
                ack: SyncedKey {
                    key: RowKey::new(table, change.row_id.clone()),
                    version: change.version,
                },
            });
        }

        Ok(outgoing)
    }

    /// Split pushed keys into acknowledged ones and the ones the server
    /// rejected
    fn acknowledged(
        &self,
        outgoing: Vec<Outgoing>,
        conflicts: &[ConflictInfo],
    ) -> (Vec<SyncedKey>, Vec<SyncedKey>) {
        for conflict in conflicts {
            warn!(
                table = %conflict.table_name,
                row_id = %conflict.row_id,
                reason = conflict.reason.as_deref().unwrap_or("unspecified"),
                "Server rejected record"
            );
        }

        let is_conflict = |key: &RowKey| {
            conflicts.iter().any(|c| {
                c.row_id == key.row_id && self.mapper.table_to_local(&c.table_name) == key.table.name()
            })
        };

        outgoing
            .into_iter()
            .map(|o| o.ack)
            .partition(|ack| !is_conflict(&ack.key))
    }

    /// Follow `has_more` until the server is drained
    async fn pull_all(
        &self,
        first_page: PullResult,
        mut cursor: Option<Checkpoint>,
        pushed: usize,
    ) -> Result<(Vec<SyncRecord>, Option<Checkpoint>), SyncError> {
        let mut records = Vec::new();
        let mut page = first_page;

        loop {
            let PullResult {
                records: page_records,
                checkpoint,
                has_more,
            } = page;

            let next = checkpoint.or_else(|| cursor.clone());
            if has_more && next == cursor {
                return Err(SyncError::Protocol(
                    "server reported more changes without advancing the checkpoint".into(),
                ));
            }

            records.extend(page_records);
            cursor = next;
            debug!(pulled = records.len(), has_more, "Pulled page");
            self.emit(SyncEvent::Progress(SyncProgress {
                pushed,
                pulled: records.len(),
                has_more,
            }));

            if !has_more {
                return Ok((records, cursor));
            }
            page = self.transport.pull(cursor.clone(), self.batch_size).await?;
        }
    }

    /// Map pulled records to local patches, last one per key wins, and
    /// split them into upserts and deletes
    fn prepare(&self, records: Vec<SyncRecord>) -> (Vec<LocalPatch>, Vec<RowKey>) {
        let mut latest: Vec<LocalPatch> = Vec::with_capacity(records.len());
        let mut index: HashMap<(String, String), usize> = HashMap::new();

        for record in records {
            let patch = self.mapper.to_local(record);
            let key = (patch.table_name.clone(), patch.row_id.clone());
            match index.get(&key).copied() {
                Some(at) => latest[at] = patch,
                None => {
                    index.insert(key, latest.len());
                    latest.push(patch);
                }
            }
        }

        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for patch in latest {
            if !patch.deleted {
                upserts.push(patch);
                continue;
            }
            match patch.table() {
                Some(table) => deletes.push(RowKey::new(table, patch.row_id)),
                None => {
                    warn!(table = %patch.table_name, row_id = %patch.row_id, "skipping delete for unknown table")
                }
            }
        }

        (upserts, deletes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::message::{DeltaResponse, PushResult};
    use async_trait::async_trait;
    use serde_json::json;

    struct NoServer;

    #[async_trait]
    impl SyncTransport for NoServer {
        fn has_credentials(&self) -> bool {
            false
        }

        async fn push(&self, _records: Vec<SyncRecord>) -> Result<PushResult, SyncError> {
            unreachable!()
        }

        async fn pull(
            &self,
            _checkpoint: Option<Checkpoint>,
            _batch_size: Option<u32>,
        ) -> Result<PullResult, SyncError> {
            unreachable!()
        }

        async fn delta(
            &self,
            _records: Vec<SyncRecord>,
            _checkpoint: Option<Checkpoint>,
            _batch_size: Option<u32>,
        ) -> Result<DeltaResponse, SyncError> {
            unreachable!()
        }
    }

    fn orchestrator() -> SyncOrchestrator {
        SyncOrchestrator::new(
            Arc::new(LocalStore::open_in_memory().unwrap()),
            Arc::new(NoServer),
        )
    }

    fn wire(table: &str, id: &str, version: i64, deleted: bool) -> SyncRecord {
        SyncRecord {
            table_name: table.to_string(),
            row_id: id.to_string(),
            data: json!({"name": format!("v{version}")}),
            version,
            deleted,
        }
    }

    #[test]
    fn test_prepare_keeps_last_change_per_key() {
        let orchestrator = orchestrator();
        let (upserts, deletes) = orchestrator.prepare(vec![
            wire("portfolios", "p-1", 1, false),
            wire("portfolios", "p-2", 1, false),
            wire("portfolios", "p-1", 2, false),
            wire("portfolios", "p-2", 2, true),
        ]);

        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].version, 2);
        assert_eq!(upserts[0].fields["name"], json!("v2"));
        assert_eq!(deletes, vec![RowKey::new(SyncTable::Portfolios, "p-2")]);
    }

    #[test]
    fn test_prepare_skips_unknown_deletes() {
        let orchestrator = orchestrator();
        let (upserts, deletes) = orchestrator.prepare(vec![
            wire("watchlists", "w-1", 1, true),
            wire("bondCouponPayments", "pay-1", 3, true),
        ]);

        assert!(upserts.is_empty());
        assert_eq!(deletes, vec![RowKey::new(SyncTable::Payments, "pay-1")]);
    }

    #[tokio::test]
    async fn test_run_without_credentials() {
        let mut orchestrator = orchestrator();
        let mut events = orchestrator.take_events().unwrap();

        let result = orchestrator.run().await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Not logged in"));
        assert_eq!(result.retry, Some(ApiRetryClass::ReauthRequired));
        assert_eq!(orchestrator.phase(), SyncPhase::Idle);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                SyncEvent::PhaseChanged(SyncPhase::Authenticating),
                SyncEvent::PhaseChanged(SyncPhase::Error),
                SyncEvent::Error("Not logged in".to_string()),
                SyncEvent::PhaseChanged(SyncPhase::Idle),
            ]
        );
    }

    #[tokio::test]
    async fn test_unread_events_are_bounded() {
        let mut orchestrator = orchestrator();
        for _ in 0..100 {
            orchestrator.run().await;
        }

        let mut events = orchestrator.take_events().unwrap();
        let mut queued = 0;
        while events.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, EVENT_BUFFER);
    }

    #[tokio::test]
    async fn test_phase_subscribers_see_cycle_end() {
        let orchestrator = orchestrator();
        let mut phases = orchestrator.subscribe_phase();

        orchestrator.run().await;

        assert!(phases.has_changed().unwrap());
        assert_eq!(*phases.borrow_and_update(), SyncPhase::Idle);
    }

    #[test]
    fn test_status_reports_pending_changes() {
        let orchestrator = orchestrator();
        let status = orchestrator.status().unwrap();

        assert!(!status.authenticated);
        assert_eq!(status.phase, SyncPhase::Idle);
        assert_eq!(status.pending_changes, 0);
        assert_eq!(status.last_sync_at, None);
        assert_eq!(status.checkpoint, None);
    }
}
