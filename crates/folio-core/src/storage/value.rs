//! Conversions between JSON field maps and SQLite rows

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, Row};
use serde_json::{Map, Number, Value};
use tracing::warn;

use super::schema::{Column, ColumnKind};
use crate::models::{LocalRecord, SyncTable};

/// Columns every entity table carries besides its domain columns
const BOOKKEEPING: [&str; 4] = ["id", "sync_version", "synced_at", "extra_fields"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    /// Fail if the id already exists
    Insert,
    /// Replace the existing row in place
    Upsert,
}

/// Convert a JSON field to the value stored in `column`
pub(crate) fn to_sql(column: &Column, value: Option<&Value>) -> SqlValue {
    let converted = match value {
        None | Some(Value::Null) => SqlValue::Null,
        Some(value) => convert(column.kind, value),
    };

    match converted {
        SqlValue::Null if column.required => zero(column.kind),
        other => other,
    }
}

fn convert(kind: ColumnKind, value: &Value) -> SqlValue {
    match (kind, value) {
        (ColumnKind::Text, Value::String(s)) => SqlValue::Text(s.clone()),
        (ColumnKind::Text, other) => SqlValue::Text(other.to_string()),
        (ColumnKind::Integer, Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(SqlValue::Integer)
            .unwrap_or(SqlValue::Null),
        (ColumnKind::Integer | ColumnKind::Bool, Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        (ColumnKind::Integer, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(SqlValue::Integer)
            .unwrap_or(SqlValue::Null),
        (ColumnKind::Bool, Value::Number(n)) => {
            SqlValue::Integer(i64::from(n.as_f64().map(|f| f != 0.0).unwrap_or(false)))
        }
        (ColumnKind::Bool, Value::String(s)) => {
            SqlValue::Integer(i64::from(matches!(s.as_str(), "true" | "1")))
        }
        (ColumnKind::Real, Value::Number(n)) => {
            n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null)
        }
        (ColumnKind::Real, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(SqlValue::Real)
            .unwrap_or(SqlValue::Null),
        _ => SqlValue::Null,
    }
}

fn zero(kind: ColumnKind) -> SqlValue {
    match kind {
        ColumnKind::Text => SqlValue::Text(String::new()),
        ColumnKind::Integer | ColumnKind::Bool => SqlValue::Integer(0),
        ColumnKind::Real => SqlValue::Real(0.0),
    }
}

/// Convert a stored value back to JSON
pub(crate) fn from_sql(kind: ColumnKind, value: SqlValue) -> Value {
    match (kind, value) {
        (_, SqlValue::Null) => Value::Null,
        (ColumnKind::Bool, SqlValue::Integer(i)) => Value::Bool(i != 0),
        (_, SqlValue::Integer(i)) => Value::from(i),
        (_, SqlValue::Real(f)) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        (_, SqlValue::Text(s)) => Value::String(s),
        (_, SqlValue::Blob(_)) => Value::Null,
    }
}

/// `SELECT` for full records of `table`, followed by `filter`
pub(crate) fn select_sql(table: SyncTable, filter: &str) -> String {
    let mut names: Vec<&str> = BOOKKEEPING.to_vec();
    names.extend(table.columns().iter().map(|c| c.name));
    format!(
        "SELECT {} FROM {} {}",
        names.join(", "),
        table.name(),
        filter
    )
}

/// Read a row selected with [`select_sql`]
pub(crate) fn read_record(table: SyncTable, row: &Row<'_>) -> rusqlite::Result<LocalRecord> {
    let id: String = row.get(0)?;
    let sync_version: i64 = row.get(1)?;
    let synced_at: Option<i64> = row.get(2)?;
    let extra: Option<String> = row.get(3)?;

    let mut fields = Map::new();
    if let Some(extra) = extra {
        match serde_json::from_str::<Value>(&extra) {
            Ok(Value::Object(extra)) => fields.extend(extra),
            _ => warn!(table = %table, id = %id, "ignoring unreadable extra_fields"),
        }
    }

    for (offset, column) in table.columns().iter().enumerate() {
        let value = from_sql(column.kind, row.get(BOOKKEEPING.len() + offset)?);
        if value.is_null() {
            fields.remove(column.name);
        } else {
            fields.insert(column.name.to_string(), value);
        }
    }

    Ok(LocalRecord {
        table,
        id,
        sync_version,
        synced_at,
        fields,
    })
}

/// Fields the local schema has no column for, as a JSON object
pub(crate) fn extra_fields(table: SyncTable, fields: &Map<String, Value>) -> Option<Map<String, Value>> {
    let columns = table.columns();
    let extra: Map<String, Value> = fields
        .iter()
        .filter(|(key, value)| {
            !value.is_null()
                && !BOOKKEEPING.contains(&key.as_str())
                && !columns.iter().any(|c| c.name == key.as_str())
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    if extra.is_empty() {
        None
    } else {
        Some(extra)
    }
}

fn extra_fields_sql(table: SyncTable, fields: &Map<String, Value>) -> SqlValue {
    extra_fields(table, fields)
        .and_then(|extra| serde_json::to_string(&Value::Object(extra)).ok())
        .map(SqlValue::Text)
        .unwrap_or(SqlValue::Null)
}

/// Write a complete row; columns missing from `fields` are stored as NULL
/// (or the zero value for required columns)
pub(crate) fn write_row(
    conn: &Connection,
    table: SyncTable,
    id: &str,
    fields: &Map<String, Value>,
    sync_version: i64,
    synced_at: Option<i64>,
    mode: WriteMode,
) -> rusqlite::Result<()> {
    let columns = table.columns();
    let mut names: Vec<&str> = BOOKKEEPING.to_vec();
    names.extend(columns.iter().map(|c| c.name));

    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.name(),
        names.join(", "),
        placeholders.join(", ")
    );
    if mode == WriteMode::Upsert {
        let updates: Vec<String> = names[1..]
            .iter()
            .map(|name| format!("{name} = excluded.{name}"))
            .collect();
        sql.push_str(" ON CONFLICT(id) DO UPDATE SET ");
        sql.push_str(&updates.join(", "));
    }

    let mut values = Vec::with_capacity(names.len());
    values.push(SqlValue::Text(id.to_string()));
    values.push(SqlValue::Integer(sync_version));
    values.push(synced_at.map(SqlValue::Integer).unwrap_or(SqlValue::Null));
    values.push(extra_fields_sql(table, fields));
    for column in columns {
        values.push(to_sql(column, fields.get(column.name)));
    }

    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

/// Patch the columns present in `fields`, bump the version and mark the
/// row dirty. Returns the number of rows changed (0 when `id` is missing).
pub(crate) fn patch_row(
    conn: &Connection,
    table: SyncTable,
    id: &str,
    fields: &Map<String, Value>,
) -> rusqlite::Result<usize> {
    let mut assignments = Vec::new();
    let mut values = Vec::new();

    for column in table.columns() {
        if fields.contains_key(column.name) {
            values.push(to_sql(column, fields.get(column.name)));
            assignments.push(format!("{} = ?{}", column.name, values.len()));
        }
    }

    if let Some(extra) = extra_fields(table, fields) {
        let patch = serde_json::to_string(&Value::Object(extra)).unwrap_or_default();
        values.push(SqlValue::Text(patch));
        assignments.push(format!(
            "extra_fields = json_patch(COALESCE(extra_fields, '{{}}'), ?{})",
            values.len()
        ));
    }

    assignments.push("sync_version = sync_version + 1".to_string());
    assignments.push("synced_at = NULL".to_string());

    values.push(SqlValue::Text(id.to_string()));
    let sql = format!(
        "UPDATE {} SET {} WHERE id = ?{}",
        table.name(),
        assignments.join(", "),
        values.len()
    );

    conn.execute(&sql, params_from_iter(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn column(table: SyncTable, name: &str) -> Column {
        *table
            .columns()
            .iter()
            .find(|c| c.name == name)
            .unwrap()
    }

    #[test]
    fn test_to_sql_coerces_loose_types() {
        let quantity = column(SyncTable::Entries, "quantity");
        assert_eq!(to_sql(&quantity, Some(&json!("2.5"))), SqlValue::Real(2.5));
        assert_eq!(to_sql(&quantity, Some(&json!(3))), SqlValue::Real(3.0));

        let alert = column(SyncTable::Entries, "alert_enabled");
        assert_eq!(to_sql(&alert, Some(&json!(true))), SqlValue::Integer(1));
        assert_eq!(to_sql(&alert, None), SqlValue::Null);
    }

    #[test]
    fn test_required_columns_fall_back_to_zero() {
        let name = column(SyncTable::Portfolios, "name");
        assert_eq!(to_sql(&name, None), SqlValue::Text(String::new()));

        let amount = column(SyncTable::Payments, "amount");
        assert_eq!(to_sql(&amount, Some(&json!({"nested": 1}))), SqlValue::Real(0.0));
    }

    #[test]
    fn test_from_sql_restores_bools() {
        assert_eq!(from_sql(ColumnKind::Bool, SqlValue::Integer(1)), json!(true));
        assert_eq!(from_sql(ColumnKind::Integer, SqlValue::Integer(1)), json!(1));
        assert_eq!(from_sql(ColumnKind::Text, SqlValue::Null), Value::Null);
    }

    #[test]
    fn test_extra_fields_only_unknown_keys() {
        let fields = json!({
            "name": "Main",
            "id": "p-1",
            "riskProfile": "aggressive",
            "archived": null
        });
        let Value::Object(fields) = fields else {
            unreachable!()
        };

        let extra = extra_fields(SyncTable::Portfolios, &fields).unwrap();
        assert_eq!(extra.len(), 1);
        assert_eq!(extra["riskProfile"], json!("aggressive"));
    }
}
