//! Local record store
//!
//! `LocalStore` owns the SQLite connection. Reads are table-scoped; every
//! composite write (remote batch, sync acknowledgement, checkpoint commit)
//! runs inside a single transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Params, Transaction};
use tracing::{debug, warn};

use super::error::{StorageError, StorageResult};
use super::schema::{init_schema, needs_init};
use super::value::{read_record, select_sql, write_row, WriteMode};
use crate::config::Config;
use crate::models::{
    ChangeOperation, Checkpoint, LocalPatch, LocalRecord, PendingChange, RowKey, SyncEntity,
    SyncTable, SyncedKey,
};

const CHECKPOINT_KEY: &str = "checkpoint";
const LAST_SYNC_AT_KEY: &str = "lastSyncAt";

/// Everything the next push has to send
#[derive(Debug, Clone, Default)]
pub struct PendingPush {
    /// Dirty rows, parents first
    pub records: Vec<LocalRecord>,
    /// Delete-log entries, in the order they were recorded
    pub deletes: Vec<PendingChange>,
}

impl PendingPush {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len() + self.deletes.len()
    }
}

/// Counters from applying a pulled batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Rows inserted or replaced
    pub applied: usize,
    /// Rows removed, including cascaded children
    pub deleted: usize,
    /// Changes ignored (unknown table, or the row has unpushed local changes)
    pub skipped: usize,
}

/// The persisted result of one sync cycle
#[derive(Debug, Clone, Default)]
pub struct CycleCommit {
    pub synced: Vec<SyncedKey>,
    /// Pushed keys the server rejected, at the version that was pushed.
    /// A pulled version replaces the local row for these as long as the row
    /// was not edited again after the push.
    pub conflicted: Vec<SyncedKey>,
    pub upserts: Vec<LocalPatch>,
    pub deletes: Vec<RowKey>,
    pub checkpoint: Option<Checkpoint>,
    pub synced_at: i64,
}

/// SQLite-backed store for portfolios, entries and payments
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Open or create the database at the configured location
    pub fn open(config: &Config) -> StorageResult<Self> {
        Self::open_path(&config.sqlite_path())
    }

    /// Open or create the database at `path`
    pub fn open_path(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        if needs_init(&conn) {
            init_schema(&conn)?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Run `f` in one transaction; nothing is committed if it fails
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // ==================== Reads ====================

    /// Get a row by id
    pub fn get(&self, table: SyncTable, id: &str) -> StorageResult<Option<LocalRecord>> {
        let conn = self.lock()?;
        get_record(&conn, table, id)
    }

    /// All rows of a table, oldest first
    pub fn list(&self, table: SyncTable) -> StorageResult<Vec<LocalRecord>> {
        let conn = self.lock()?;
        query_records(&conn, table, "ORDER BY created_at, id", [])
    }

    /// Rows of `table` owned by `parent_id`
    pub fn children(&self, table: SyncTable, parent_id: &str) -> StorageResult<Vec<LocalRecord>> {
        let Some((_, fk)) = table.parent() else {
            return Ok(Vec::new());
        };
        let conn = self.lock()?;
        query_records(
            &conn,
            table,
            &format!("WHERE {} = ?1 ORDER BY created_at, id", fk),
            [parent_id],
        )
    }

    /// Typed lookup
    pub fn get_as<E: SyncEntity>(&self, id: &str) -> StorageResult<Option<E>> {
        self.get(E::TABLE, id)?
            .map(|record| E::from_record(&record).map_err(StorageError::from))
            .transpose()
    }

    /// Typed listing
    pub fn list_as<E: SyncEntity>(&self) -> StorageResult<Vec<E>> {
        self.list(E::TABLE)?
            .iter()
            .map(|record| E::from_record(record).map_err(StorageError::from))
            .collect()
    }

    /// Typed listing of children owned by `parent_id`
    pub fn children_as<E: SyncEntity>(&self, parent_id: &str) -> StorageResult<Vec<E>> {
        self.children(E::TABLE, parent_id)?
            .iter()
            .map(|record| E::from_record(record).map_err(StorageError::from))
            .collect()
    }

    /// Rows of `table_name` with unacknowledged local changes
    ///
    /// An unknown table is logged and yields no rows.
    pub fn list_dirty(&self, table_name: &str) -> StorageResult<Vec<LocalRecord>> {
        let Some(table) = SyncTable::from_name(table_name) else {
            warn!(table = table_name, "list_dirty on unknown table");
            return Ok(Vec::new());
        };
        let conn = self.lock()?;
        dirty_records(&conn, table)
    }

    /// Every dirty row plus every delete-log entry, read under one lock
    pub fn pending_push(&self) -> StorageResult<PendingPush> {
        let conn = self.lock()?;
        let mut records = Vec::new();
        for table in SyncTable::ALL {
            records.extend(dirty_records(&conn, table)?);
        }
        let deletes = read_pending(&conn, "WHERE operation = 'delete'")?;
        Ok(PendingPush { records, deletes })
    }

    /// The whole pending-change log
    pub fn pending_changes(&self) -> StorageResult<Vec<PendingChange>> {
        let conn = self.lock()?;
        read_pending(&conn, "")
    }

    /// Number of local changes waiting to be pushed
    pub fn pending_change_count(&self) -> StorageResult<usize> {
        let conn = self.lock()?;
        let mut count: i64 = 0;
        for table in SyncTable::ALL {
            count += conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE synced_at IS NULL",
                    table.name()
                ),
                [],
                |row| row.get::<_, i64>(0),
            )?;
        }
        count += conn.query_row(
            "SELECT COUNT(*) FROM pending_changes WHERE operation = 'delete'",
            [],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count as usize)
    }

    /// Last committed server checkpoint
    pub fn checkpoint(&self) -> StorageResult<Option<Checkpoint>> {
        let conn = self.lock()?;
        match get_meta(&conn, CHECKPOINT_KEY)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Unix time of the last successful sync cycle
    pub fn last_sync_at(&self) -> StorageResult<Option<i64>> {
        let conn = self.lock()?;
        Ok(get_meta(&conn, LAST_SYNC_AT_KEY)?.and_then(|raw| raw.parse().ok()))
    }

    // ==================== Sync writes ====================

    /// Apply pulled changes in one transaction
    ///
    /// Upserts run parent-first and deletes child-first whatever the input
    /// order. Any failure rolls the whole batch back.
    pub fn apply_batch(
        &self,
        upserts: &[LocalPatch],
        deletes: &[RowKey],
    ) -> StorageResult<ApplyOutcome> {
        let now = Utc::now().timestamp();
        self.write(|tx| apply_changes(tx, upserts, deletes, &[], now))
    }

    /// Record server acknowledgement of pushed rows
    pub fn mark_synced(&self, keys: &[SyncedKey]) -> StorageResult<usize> {
        let now = Utc::now().timestamp();
        self.write(|tx| mark_synced_in(tx, keys, now))
    }

    /// Persist a finished cycle: acknowledgements, pulled changes and the
    /// new checkpoint commit together or not at all
    pub fn commit_cycle(&self, commit: &CycleCommit) -> StorageResult<ApplyOutcome> {
        self.write(|tx| {
            mark_synced_in(tx, &commit.synced, commit.synced_at)?;
            let outcome = apply_changes(
                tx,
                &commit.upserts,
                &commit.deletes,
                &commit.conflicted,
                commit.synced_at,
            )?;

            if let Some(checkpoint) = &commit.checkpoint {
                set_meta(tx, CHECKPOINT_KEY, &serde_json::to_string(checkpoint)?)?;
            }
            set_meta(tx, LAST_SYNC_AT_KEY, &commit.synced_at.to_string())?;

            Ok(outcome)
        })
    }

    #[cfg(test)]
    pub(crate) fn raw(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ==================== Helpers (run on a connection or transaction) ====================

pub(crate) fn get_record(
    conn: &Connection,
    table: SyncTable,
    id: &str,
) -> StorageResult<Option<LocalRecord>> {
    let mut stmt = conn.prepare(&select_sql(table, "WHERE id = ?1"))?;
    Ok(stmt
        .query_row([id], |row| read_record(table, row))
        .optional()?)
}

fn query_records<P: Params>(
    conn: &Connection,
    table: SyncTable,
    filter: &str,
    params: P,
) -> StorageResult<Vec<LocalRecord>> {
    let mut stmt = conn.prepare(&select_sql(table, filter))?;
    let records = stmt
        .query_map(params, |row| read_record(table, row))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

fn dirty_records(conn: &Connection, table: SyncTable) -> StorageResult<Vec<LocalRecord>> {
    query_records(
        conn,
        table,
        "WHERE synced_at IS NULL ORDER BY created_at, id",
        [],
    )
}

/// Ids of `child` rows owned by `parent_id`
pub(crate) fn child_ids(
    conn: &Connection,
    child: SyncTable,
    parent_id: &str,
) -> StorageResult<Vec<String>> {
    let Some((_, fk)) = child.parent() else {
        return Ok(Vec::new());
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM {} WHERE {} = ?1 ORDER BY id",
        child.name(),
        fk
    ))?;
    let ids = stmt
        .query_map([parent_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

/// Remove a row and everything it owns, deepest rows first
pub(crate) fn delete_subtree(conn: &Connection, table: SyncTable, id: &str) -> StorageResult<usize> {
    let mut removed = 0;
    if let Some(child) = table.child() {
        for child_id in child_ids(conn, child, id)? {
            removed += delete_subtree(conn, child, &child_id)?;
        }
    }
    removed += conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1", table.name()),
        [id],
    )?;
    Ok(removed)
}

/// Remove a row and everything it owns together with their log entries
fn discard_subtree(conn: &Connection, table: SyncTable, id: &str) -> StorageResult<usize> {
    let mut removed = 0;
    if let Some(child) = table.child() {
        for child_id in child_ids(conn, child, id)? {
            removed += discard_subtree(conn, child, &child_id)?;
        }
    }
    conn.execute(
        "DELETE FROM pending_changes WHERE table_name = ?1 AND row_id = ?2",
        params![table.name(), id],
    )?;
    removed += conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1", table.name()),
        [id],
    )?;
    Ok(removed)
}

/// Write or replace the single log entry for a key
pub(crate) fn upsert_pending(
    conn: &Connection,
    key: &RowKey,
    operation: ChangeOperation,
    data: Option<&serde_json::Value>,
    version: i64,
    now: i64,
) -> StorageResult<()> {
    let data = match data.map(serde_json::to_string).transpose()? {
        Some(data) => Some(data),
        None => conn
            .query_row(
                "SELECT data FROM pending_changes WHERE table_name = ?1 AND row_id = ?2",
                params![key.table.name(), key.row_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten(),
    };

    // Re-inserting keeps log ids in write order
    conn.execute(
        "DELETE FROM pending_changes WHERE table_name = ?1 AND row_id = ?2",
        params![key.table.name(), key.row_id],
    )?;
    conn.execute(
        "INSERT INTO pending_changes (table_name, row_id, operation, data, version, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            key.table.name(),
            key.row_id,
            operation.as_str(),
            data,
            version,
            now
        ],
    )?;
    Ok(())
}

/// Log entry currently held for a key
pub(crate) fn pending_for(conn: &Connection, key: &RowKey) -> StorageResult<Option<PendingChange>> {
    let mut entries = read_pending_where(
        conn,
        "WHERE table_name = ?1 AND row_id = ?2",
        params![key.table.name(), key.row_id],
    )?;
    Ok(entries.pop())
}

fn read_pending(conn: &Connection, filter: &str) -> StorageResult<Vec<PendingChange>> {
    read_pending_where(conn, filter, [])
}

fn read_pending_where<P: Params>(
    conn: &Connection,
    filter: &str,
    params: P,
) -> StorageResult<Vec<PendingChange>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, table_name, row_id, operation, data, version, created_at
         FROM pending_changes {} ORDER BY id",
        filter
    ))?;
    let rows = stmt
        .query_map(params, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut entries = Vec::with_capacity(rows.len());
    for (id, table_name, row_id, operation, data, version, created_at) in rows {
        let Some(operation) = ChangeOperation::parse(&operation) else {
            warn!(id, operation = %operation, "skipping pending change with unknown operation");
            continue;
        };
        entries.push(PendingChange {
            id,
            table_name,
            row_id,
            operation,
            data: data.and_then(|raw| serde_json::from_str(&raw).ok()),
            version,
            created_at,
        });
    }
    Ok(entries)
}

/// True when a row has changes that still need to reach the server
fn has_local_changes(conn: &Connection, table: SyncTable, id: &str) -> StorageResult<bool> {
    let dirty: Option<bool> = conn
        .query_row(
            &format!("SELECT synced_at IS NULL FROM {} WHERE id = ?1", table.name()),
            [id],
            |row| row.get(0),
        )
        .optional()?;
    if dirty == Some(true) {
        return Ok(true);
    }

    let logged = conn
        .prepare("SELECT 1 FROM pending_changes WHERE table_name = ?1 AND row_id = ?2")?
        .exists(params![table.name(), id])?;
    Ok(logged)
}

/// True when `key` was rejected at `pushed` and nothing changed locally since
fn superseded_by_server(
    conn: &Connection,
    key: &RowKey,
    conflicted: &[SyncedKey],
) -> StorageResult<bool> {
    let Some(pushed) = conflicted
        .iter()
        .find(|c| c.key == *key)
        .map(|c| c.version)
    else {
        return Ok(false);
    };

    let current: Option<i64> = conn
        .query_row(
            &format!("SELECT sync_version FROM {} WHERE id = ?1", key.table.name()),
            [&key.row_id],
            |row| row.get(0),
        )
        .optional()?;
    if current.is_some_and(|version| version != pushed) {
        return Ok(false);
    }

    let newer_log = conn
        .prepare(
            "SELECT 1 FROM pending_changes WHERE table_name = ?1 AND row_id = ?2 AND version > ?3",
        )?
        .exists(params![key.table.name(), key.row_id, pushed])?;
    Ok(!newer_log)
}

fn apply_changes(
    conn: &Connection,
    upserts: &[LocalPatch],
    deletes: &[RowKey],
    conflicted: &[SyncedKey],
    now: i64,
) -> StorageResult<ApplyOutcome> {
    let mut outcome = ApplyOutcome::default();

    let mut ordered: Vec<(SyncTable, &LocalPatch)> = Vec::with_capacity(upserts.len());
    for patch in upserts {
        match patch.table() {
            Some(table) => ordered.push((table, patch)),
            None => {
                warn!(table = %patch.table_name, row_id = %patch.row_id, "skipping change for unknown table");
                outcome.skipped += 1;
            }
        }
    }
    ordered.sort_by_key(|(table, _)| table.depth());

    for (table, patch) in ordered {
        if has_local_changes(conn, table, &patch.row_id)? {
            let key = RowKey::new(table, patch.row_id.clone());
            if !superseded_by_server(conn, &key, conflicted)? {
                debug!(table = %table, row_id = %patch.row_id, "row edited during sync, keeping local change");
                outcome.skipped += 1;
                continue;
            }
            debug!(table = %table, row_id = %patch.row_id, "replacing rejected local change with server version");
            conn.execute(
                "DELETE FROM pending_changes WHERE table_name = ?1 AND row_id = ?2",
                params![table.name(), patch.row_id],
            )?;
        }
        write_row(
            conn,
            table,
            &patch.row_id,
            &patch.fields,
            patch.version,
            Some(now),
            WriteMode::Upsert,
        )?;
        outcome.applied += 1;
    }

    let mut deletes: Vec<&RowKey> = deletes.iter().collect();
    deletes.sort_by_key(|key| std::cmp::Reverse(key.table.depth()));

    for key in deletes {
        outcome.deleted += discard_subtree(conn, key.table, &key.row_id)?;
    }

    Ok(outcome)
}

fn mark_synced_in(conn: &Connection, keys: &[SyncedKey], now: i64) -> StorageResult<usize> {
    let mut marked = 0;
    for SyncedKey { key, version } in keys {
        marked += conn.execute(
            &format!(
                "UPDATE {} SET synced_at = ?1 WHERE id = ?2 AND sync_version = ?3",
                key.table.name()
            ),
            params![now, key.row_id, version],
        )?;
        conn.execute(
            "DELETE FROM pending_changes WHERE table_name = ?1 AND row_id = ?2 AND version <= ?3",
            params![key.table.name(), key.row_id, version],
        )?;
    }
    Ok(marked)
}

fn get_meta(conn: &Connection, key: &str) -> StorageResult<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM sync_meta WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?)
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}
