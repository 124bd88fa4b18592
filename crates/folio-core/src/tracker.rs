//! Local change tracking
//!
//! Every local mutation of a synchronized row goes through `ChangeTracker`:
//!
//! - create: `sync_version = 1`, dirty, `create` log entry
//! - update: `sync_version + 1`, dirty, `update` log entry
//! - delete: `delete` log entry with `version + 1` and a snapshot of the row,
//!   written in the same transaction as the physical delete
//!
//! Deleting a parent deletes everything it owns. All affected rows are logged
//! deepest-first before any of them is removed.

use std::cmp::Reverse;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::debug;

use crate::models::{ChangeOperation, LocalRecord, RowKey, SyncEntity, SyncTable};
use crate::storage::store::{child_ids, delete_subtree, get_record, pending_for, upsert_pending};
use crate::storage::value::{patch_row, write_row, WriteMode};
use crate::storage::{LocalStore, StorageError, StorageResult};

/// Stamps versions and keeps the pending-change log for local edits
#[derive(Clone)]
pub struct ChangeTracker {
    store: Arc<LocalStore>,
}

impl ChangeTracker {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Insert a new row as version 1, dirty
    ///
    /// `created_at` is filled with the current time when absent.
    pub fn record_create(
        &self,
        table: SyncTable,
        id: &str,
        fields: &Map<String, Value>,
    ) -> StorageResult<LocalRecord> {
        let now = Utc::now().timestamp();
        let mut fields = fields.clone();
        if fields.get("created_at").map_or(true, Value::is_null) {
            fields.insert("created_at".to_string(), Value::from(now));
        }
        let key = RowKey::new(table, id);

        let record = self.store.write(|tx| {
            write_row(tx, table, id, &fields, 1, None, WriteMode::Insert)?;
            upsert_pending(tx, &key, ChangeOperation::Create, None, 1, now)?;
            get_record(tx, table, id)?.ok_or_else(|| StorageError::not_found(table.name(), id))
        })?;

        debug!(table = %table, id, "recorded create");
        Ok(record)
    }

    /// Patch the given columns, bump the version and mark the row dirty
    ///
    /// Returns the new version.
    pub fn record_update(
        &self,
        table: SyncTable,
        id: &str,
        fields: &Map<String, Value>,
    ) -> StorageResult<i64> {
        let now = Utc::now().timestamp();
        let key = RowKey::new(table, id);

        let version = self.store.write(|tx| {
            if patch_row(tx, table, id, fields)? == 0 {
                return Err(StorageError::not_found(table.name(), id));
            }
            let version: i64 = tx.query_row(
                &format!("SELECT sync_version FROM {} WHERE id = ?1", table.name()),
                [id],
                |row| row.get(0),
            )?;

            // A create the server has not seen yet stays a create
            let operation = match pending_for(tx, &key)? {
                Some(entry) if entry.operation == ChangeOperation::Create => ChangeOperation::Create,
                _ => ChangeOperation::Update,
            };
            upsert_pending(tx, &key, operation, None, version, now)?;
            Ok(version)
        })?;

        debug!(table = %table, id, version, "recorded update");
        Ok(version)
    }

    /// Delete a row (and everything it owns), logging each removal
    ///
    /// `prior_version` is the version of the row as the caller last saw it;
    /// the log entry carries `prior_version + 1`. Owned rows are logged with
    /// their own stored version + 1. Returns the number of rows removed.
    pub fn record_delete(
        &self,
        table: SyncTable,
        id: &str,
        prior_version: i64,
    ) -> StorageResult<usize> {
        let now = Utc::now().timestamp();

        let removed = self.store.write(|tx| {
            let mut doomed = Vec::new();
            collect_owned(tx, table, id, &mut doomed)?;
            doomed.sort_by_key(|(key, _, _)| Reverse(key.table.depth()));

            let root = RowKey::new(table, id);
            let root_snapshot = get_record(tx, table, id)?;
            doomed.push((root, prior_version, root_snapshot));

            for (key, version, snapshot) in &doomed {
                let data = snapshot.as_ref().map(serde_json::to_value).transpose()?;
                upsert_pending(tx, key, ChangeOperation::Delete, data.as_ref(), version + 1, now)?;
            }

            delete_subtree(tx, table, id)
        })?;

        debug!(table = %table, id, removed, "recorded delete");
        Ok(removed)
    }

    /// Insert a typed entity
    pub fn create<E: SyncEntity>(&self, entity: &E) -> StorageResult<LocalRecord> {
        self.record_create(E::TABLE, entity.id(), &entity.to_fields()?)
    }

    /// Replace a typed entity's fields
    pub fn update<E: SyncEntity>(&self, entity: &E) -> StorageResult<i64> {
        self.record_update(E::TABLE, entity.id(), &entity.to_fields()?)
    }

    /// Delete the row with its currently stored version
    pub fn delete(&self, table: SyncTable, id: &str) -> StorageResult<usize> {
        let record = self
            .store
            .get(table, id)?
            .ok_or_else(|| StorageError::not_found(table.name(), id))?;
        self.record_delete(table, id, record.sync_version)
    }
}

type Doomed = (RowKey, i64, Option<LocalRecord>);

/// Collect every row owned (directly or transitively) by `table`/`id`
fn collect_owned(
    conn: &Connection,
    table: SyncTable,
    id: &str,
    out: &mut Vec<Doomed>,
) -> StorageResult<()> {
    let Some(child) = table.child() else {
        return Ok(());
    };

    for child_id in child_ids(conn, child, id)? {
        collect_owned(conn, child, &child_id, out)?;
        let record = get_record(conn, child, &child_id)?;
        let version = record.as_ref().map_or(1, |r| r.sync_version);
        out.push((RowKey::new(child, child_id), version, record));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetType, Entry, Payment, Portfolio, SyncedKey};

    fn tracker() -> ChangeTracker {
        ChangeTracker::new(Arc::new(LocalStore::open_in_memory().unwrap()))
    }

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_create_stamps_version_one() {
        let tracker = tracker();

        let record = tracker
            .record_create(
                SyncTable::Portfolios,
                "p-1",
                &fields(serde_json::json!({"name": "Main"})),
            )
            .unwrap();

        assert_eq!(record.sync_version, 1);
        assert!(record.is_dirty());
        assert!(record.fields["created_at"].as_i64().unwrap() > 0);

        let log = tracker.store().pending_changes().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].operation, ChangeOperation::Create);
    }

    #[test]
    fn test_update_bumps_version_and_marks_dirty() {
        let tracker = tracker();
        let mut portfolio = Portfolio::new("Main");
        tracker.create(&portfolio).unwrap();
        tracker
            .store()
            .mark_synced(&[SyncedKey {
                key: RowKey::new(SyncTable::Portfolios, portfolio.id.clone()),
                version: 1,
            }])
            .unwrap();

        portfolio.description = Some("Long term".to_string());
        let version = tracker.update(&portfolio).unwrap();
        assert_eq!(version, 2);

        let stored = tracker
            .store()
            .get(SyncTable::Portfolios, &portfolio.id)
            .unwrap()
            .unwrap();
        assert!(stored.is_dirty());
        assert_eq!(stored.sync_version, 2);

        let log = tracker.store().pending_changes().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].operation, ChangeOperation::Update);
        assert_eq!(log[0].version, 2);
    }

    #[test]
    fn test_update_before_first_push_stays_create() {
        let tracker = tracker();
        let mut portfolio = Portfolio::new("Main");
        tracker.create(&portfolio).unwrap();

        portfolio.name = "Renamed".to_string();
        tracker.update(&portfolio).unwrap();

        let log = tracker.store().pending_changes().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].operation, ChangeOperation::Create);
        assert_eq!(log[0].version, 2);
    }

    #[test]
    fn test_update_missing_row() {
        let tracker = tracker();
        let err = tracker
            .record_update(
                SyncTable::Entries,
                "nope",
                &fields(serde_json::json!({"symbol": "X"})),
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[test]
    fn test_delete_logs_exactly_one_entry() {
        let tracker = tracker();
        let portfolio = Portfolio::new("Main");
        tracker.create(&portfolio).unwrap();

        tracker
            .record_delete(SyncTable::Portfolios, &portfolio.id, 4)
            .unwrap();
        tracker
            .record_delete(SyncTable::Portfolios, &portfolio.id, 4)
            .unwrap();

        let log = tracker.store().pending_changes().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].operation, ChangeOperation::Delete);
        assert_eq!(log[0].version, 5);
        // Snapshot from the first delete is kept
        assert!(log[0].data.is_some());
        assert!(tracker
            .store()
            .get(SyncTable::Portfolios, &portfolio.id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_cascade_logs_bottom_up() {
        let tracker = tracker();
        let portfolio = Portfolio::new("Main");
        tracker.create(&portfolio).unwrap();

        let mut entry_ids = Vec::new();
        for symbol in ["AAPL", "GB10Y"] {
            let entry = Entry::new(&portfolio.id, AssetType::Stock, symbol, 1.0, 10.0);
            tracker.create(&entry).unwrap();
            tracker.create(&Payment::new(&entry.id, 1.0, "USD")).unwrap();
            entry_ids.push(entry.id);
        }

        let removed = tracker.delete(SyncTable::Portfolios, &portfolio.id).unwrap();
        assert_eq!(removed, 5);

        let deletes: Vec<_> = tracker
            .store()
            .pending_changes()
            .unwrap()
            .into_iter()
            .filter(|c| c.operation == ChangeOperation::Delete)
            .collect();
        assert_eq!(deletes.len(), 5);

        let depths: Vec<u8> = deletes
            .iter()
            .map(|c| SyncTable::from_name(&c.table_name).unwrap().depth())
            .collect();
        assert_eq!(depths, vec![2, 2, 1, 1, 0]);
        assert_eq!(deletes[4].row_id, portfolio.id);
        assert!(deletes[2..4].iter().all(|c| entry_ids.contains(&c.row_id)));

        for table in SyncTable::ALL {
            assert!(tracker.store().list(table).unwrap().is_empty());
        }
    }

    #[test]
    fn test_failed_log_write_aborts_delete() {
        let tracker = tracker();
        let portfolio = Portfolio::new("Main");
        tracker.create(&portfolio).unwrap();

        tracker
            .store()
            .raw()
            .execute_batch("DROP TABLE pending_changes;")
            .unwrap();

        assert!(tracker
            .record_delete(SyncTable::Portfolios, &portfolio.id, 1)
            .is_err());
        assert!(tracker
            .store()
            .get(SyncTable::Portfolios, &portfolio.id)
            .unwrap()
            .is_some());
    }
}
