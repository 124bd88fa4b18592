//! SQLite schema for the local store
//!
//! Three entity tables form an ownership tree (portfolios → entries →
//! payments). Foreign keys are enforced without cascades, so rows must be
//! written parent-first and removed child-first.
//!
//! Every entity table carries the same bookkeeping columns:
//! `sync_version`, `synced_at` (NULL while dirty) and `extra_fields`.

use rusqlite::{Connection, Result};

use crate::models::SyncTable;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Storage class of a domain column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
    /// Stored as INTEGER 0/1, surfaced as a JSON bool
    Bool,
}

/// A domain column of a synchronized table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
    /// NOT NULL in the schema; a missing value is written as the zero value
    pub required: bool,
}

const fn col(name: &'static str, kind: ColumnKind) -> Column {
    Column {
        name,
        kind,
        required: false,
    }
}

const fn req(name: &'static str, kind: ColumnKind) -> Column {
    Column {
        name,
        kind,
        required: true,
    }
}

use self::ColumnKind::{Bool, Integer, Real, Text};

const PORTFOLIO_COLUMNS: &[Column] = &[
    req("name", Text),
    col("description", Text),
    col("base_currency", Text),
    req("created_at", Integer),
];

const ENTRY_COLUMNS: &[Column] = &[
    req("portfolio_id", Text),
    req("asset_type", Text),
    req("symbol", Text),
    req("quantity", Real),
    req("purchase_price", Real),
    col("currency", Text),
    req("purchase_date", Integer),
    col("notes", Text),
    col("tags", Text),
    col("transaction_fees", Real),
    col("source", Text),
    col("unit", Text),
    col("gold_type", Text),
    col("face_value", Real),
    col("coupon_rate", Real),
    col("maturity_date", Integer),
    col("coupon_frequency", Text),
    col("current_market_price", Real),
    col("last_price_update", Integer),
    col("ytm", Real),
    col("target_price", Real),
    col("stop_loss", Real),
    col("alert_enabled", Bool),
    req("created_at", Integer),
];

const PAYMENT_COLUMNS: &[Column] = &[
    req("entry_id", Text),
    req("payment_date", Integer),
    req("amount", Real),
    req("currency", Text),
    col("notes", Text),
    req("created_at", Integer),
];

/// Domain columns for a table
pub fn columns(table: SyncTable) -> &'static [Column] {
    match table {
        SyncTable::Portfolios => PORTFOLIO_COLUMNS,
        SyncTable::Entries => ENTRY_COLUMNS,
        SyncTable::Payments => PAYMENT_COLUMNS,
    }
}

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS portfolios (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            base_currency TEXT,
            created_at INTEGER NOT NULL,
            sync_version INTEGER NOT NULL DEFAULT 1,
            synced_at INTEGER,
            extra_fields TEXT
        );

        CREATE TABLE IF NOT EXISTS portfolio_entries (
            id TEXT PRIMARY KEY,
            portfolio_id TEXT NOT NULL,
            asset_type TEXT NOT NULL,
            symbol TEXT NOT NULL,
            quantity REAL NOT NULL,
            purchase_price REAL NOT NULL,
            currency TEXT,
            purchase_date INTEGER NOT NULL,
            notes TEXT,
            tags TEXT,
            transaction_fees REAL,
            source TEXT,
            unit TEXT,
            gold_type TEXT,
            face_value REAL,
            coupon_rate REAL,
            maturity_date INTEGER,
            coupon_frequency TEXT,
            current_market_price REAL,
            last_price_update INTEGER,
            ytm REAL,
            target_price REAL,
            stop_loss REAL,
            alert_enabled INTEGER,
            created_at INTEGER NOT NULL,
            sync_version INTEGER NOT NULL DEFAULT 1,
            synced_at INTEGER,
            extra_fields TEXT,
            FOREIGN KEY (portfolio_id) REFERENCES portfolios(id)
        );

        CREATE TABLE IF NOT EXISTS bond_coupon_payments (
            id TEXT PRIMARY KEY,
            entry_id TEXT NOT NULL,
            payment_date INTEGER NOT NULL,
            amount REAL NOT NULL,
            currency TEXT NOT NULL,
            notes TEXT,
            created_at INTEGER NOT NULL,
            sync_version INTEGER NOT NULL DEFAULT 1,
            synced_at INTEGER,
            extra_fields TEXT,
            FOREIGN KEY (entry_id) REFERENCES portfolio_entries(id)
        );

        -- Local mutations not yet acknowledged by the server
        CREATE TABLE IF NOT EXISTS pending_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            row_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            data TEXT,
            version INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );

        -- Checkpoint and last sync time
        CREATE TABLE IF NOT EXISTS sync_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_pending_changes_key
            ON pending_changes(table_name, row_id);

        -- Dirty-set scans
        CREATE INDEX IF NOT EXISTS idx_portfolios_synced_at ON portfolios(synced_at);
        CREATE INDEX IF NOT EXISTS idx_entries_synced_at ON portfolio_entries(synced_at);
        CREATE INDEX IF NOT EXISTS idx_payments_synced_at ON bond_coupon_payments(synced_at);

        -- Child lookups for cascades
        CREATE INDEX IF NOT EXISTS idx_entries_portfolio_id ON portfolio_entries(portfolio_id);
        CREATE INDEX IF NOT EXISTS idx_payments_entry_id ON bond_coupon_payments(entry_id);
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_columns(conn: &Connection, table: &str) -> Vec<String> {
        conn.prepare(&format!("PRAGMA table_info({})", table))
            .unwrap()
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_init_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for table in SyncTable::ALL {
            assert!(tables.contains(&table.name().to_string()));
        }
        assert!(tables.contains(&"pending_changes".to_string()));
        assert!(tables.contains(&"sync_meta".to_string()));
    }

    #[test]
    fn test_schema_version() {
        let conn = Connection::open_in_memory().unwrap();

        assert!(needs_init(&conn));

        init_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
        assert!(!needs_init(&conn));
    }

    #[test]
    fn test_column_descriptors_match_ddl() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        for table in SyncTable::ALL {
            let actual = table_columns(&conn, table.name());
            for column in columns(table) {
                assert!(
                    actual.contains(&column.name.to_string()),
                    "{} is missing {}",
                    table,
                    column.name
                );
            }
            // id + bookkeeping columns
            assert_eq!(actual.len(), columns(table).len() + 4);
        }
    }

    #[test]
    fn test_foreign_keys_reject_orphans() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        init_schema(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO bond_coupon_payments (id, entry_id, payment_date, amount, currency, created_at)
             VALUES ('pay-1', 'missing', 0, 1.0, 'USD', 0)",
            [],
        );
        assert!(result.is_err());
    }
}
