//! Data models for Folio
//!
//! Defines the three synchronized entities (Portfolio, Entry, Payment), the
//! generic row shape the sync engine moves around, and the pending-change
//! log entry written for local deletions.

use std::fmt;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::storage::schema::{self, Column};

/// The synchronized tables, declared parent-first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTable {
    Portfolios,
    Entries,
    Payments,
}

impl SyncTable {
    /// All tables, parents before children
    pub const ALL: [SyncTable; 3] = [SyncTable::Portfolios, SyncTable::Entries, SyncTable::Payments];

    /// Local table name
    pub fn name(&self) -> &'static str {
        match self {
            SyncTable::Portfolios => "portfolios",
            SyncTable::Entries => "portfolio_entries",
            SyncTable::Payments => "bond_coupon_payments",
        }
    }

    /// Resolve a local table name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Distance from the root of the ownership tree
    ///
    /// Upserts apply in ascending depth, deletes in descending depth.
    pub fn depth(&self) -> u8 {
        match self {
            SyncTable::Portfolios => 0,
            SyncTable::Entries => 1,
            SyncTable::Payments => 2,
        }
    }

    /// The owning table and the column referencing it
    pub fn parent(&self) -> Option<(SyncTable, &'static str)> {
        match self {
            SyncTable::Portfolios => None,
            SyncTable::Entries => Some((SyncTable::Portfolios, "portfolio_id")),
            SyncTable::Payments => Some((SyncTable::Entries, "entry_id")),
        }
    }

    /// The directly owned table, if any
    pub fn child(&self) -> Option<SyncTable> {
        match self {
            SyncTable::Portfolios => Some(SyncTable::Entries),
            SyncTable::Entries => Some(SyncTable::Payments),
            SyncTable::Payments => None,
        }
    }

    /// Domain columns (everything except the sync bookkeeping columns)
    pub fn columns(&self) -> &'static [Column] {
        schema::columns(*self)
    }
}

impl fmt::Display for SyncTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies one row in one table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowKey {
    pub table: SyncTable,
    pub row_id: String,
}

impl RowKey {
    pub fn new(table: SyncTable, row_id: impl Into<String>) -> Self {
        Self {
            table,
            row_id: row_id.into(),
        }
    }
}

/// A row the server acknowledged, with the version that was pushed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedKey {
    pub key: RowKey,
    pub version: i64,
}

/// A row from any synchronized table
///
/// `fields` holds domain columns under their local names plus any fields
/// received from the server that the local schema does not know.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalRecord {
    pub table: SyncTable,
    pub id: String,
    pub sync_version: i64,
    pub synced_at: Option<i64>,
    pub fields: Map<String, Value>,
}

impl LocalRecord {
    /// True when the row has local changes the server has not acknowledged
    pub fn is_dirty(&self) -> bool {
        self.synced_at.is_none()
    }

    pub fn key(&self) -> RowKey {
        RowKey::new(self.table, self.id.clone())
    }
}

/// A pulled change translated to local naming
///
/// `table_name` is a local table name; it may be one this client does not
/// know, in which case the store skips the patch.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalPatch {
    pub table_name: String,
    pub row_id: String,
    pub version: i64,
    pub deleted: bool,
    pub fields: Map<String, Value>,
}

impl LocalPatch {
    pub fn table(&self) -> Option<SyncTable> {
        SyncTable::from_name(&self.table_name)
    }
}

/// Opaque server cursor marking the last change already applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(pub Value);

/// Kind of local mutation recorded in the pending-change log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Create => "create",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(ChangeOperation::Create),
            "update" => Some(ChangeOperation::Update),
            "delete" => Some(ChangeOperation::Delete),
            _ => None,
        }
    }
}

/// An entry in the pending-change log
///
/// There is at most one entry per `(table_name, row_id)`. For deletes,
/// `data` holds a snapshot of the row as it was removed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingChange {
    pub id: i64,
    pub table_name: String,
    pub row_id: String,
    pub operation: ChangeOperation,
    pub data: Option<Value>,
    pub version: i64,
    pub created_at: i64,
}

/// A domain struct stored in one of the synchronized tables
///
/// Field names of the serialized struct are the local column names.
pub trait SyncEntity: Serialize + DeserializeOwned {
    const TABLE: SyncTable;

    fn id(&self) -> &str;

    /// Domain fields as a column map (without `id`)
    fn to_fields(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(mut map) => {
                map.remove("id");
                Ok(map)
            }
            _ => Ok(Map::new()),
        }
    }

    /// Rebuild the domain struct from a stored row
    fn from_record(record: &LocalRecord) -> Result<Self, serde_json::Error> {
        let mut map = record.fields.clone();
        map.insert("id".to_string(), Value::String(record.id.clone()));
        serde_json::from_value(Value::Object(map))
    }
}

/// A named collection of holdings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Portfolio {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub base_currency: Option<String>,
    pub created_at: i64,
}

impl Portfolio {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            base_currency: None,
            created_at: Utc::now().timestamp(),
        }
    }
}

impl SyncEntity for Portfolio {
    const TABLE: SyncTable = SyncTable::Portfolios;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Supported asset classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Stock,
    Gold,
    Bond,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Stock => "stock",
            AssetType::Gold => "gold",
            AssetType::Bond => "bond",
        }
    }
}

impl std::str::FromStr for AssetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stock" => Ok(AssetType::Stock),
            "gold" => Ok(AssetType::Gold),
            "bond" => Ok(AssetType::Bond),
            other => Err(format!("unknown asset type '{}'", other)),
        }
    }
}

/// A single holding inside a portfolio
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub id: String,
    pub portfolio_id: String,
    pub asset_type: AssetType,
    pub symbol: String,
    pub quantity: f64,
    pub purchase_price: f64,
    pub currency: Option<String>,
    pub purchase_date: i64,
    pub notes: Option<String>,
    pub tags: Option<String>,
    pub transaction_fees: Option<f64>,
    pub source: Option<String>,
    pub unit: Option<String>,
    pub gold_type: Option<String>,
    pub face_value: Option<f64>,
    pub coupon_rate: Option<f64>,
    pub maturity_date: Option<i64>,
    pub coupon_frequency: Option<String>,
    pub current_market_price: Option<f64>,
    pub last_price_update: Option<i64>,
    pub ytm: Option<f64>,
    pub target_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub alert_enabled: Option<bool>,
    pub created_at: i64,
}

impl Entry {
    pub fn new(
        portfolio_id: impl Into<String>,
        asset_type: AssetType,
        symbol: impl Into<String>,
        quantity: f64,
        purchase_price: f64,
    ) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            portfolio_id: portfolio_id.into(),
            asset_type,
            symbol: symbol.into(),
            quantity,
            purchase_price,
            currency: None,
            purchase_date: now,
            notes: None,
            tags: None,
            transaction_fees: None,
            source: None,
            unit: None,
            gold_type: None,
            face_value: None,
            coupon_rate: None,
            maturity_date: None,
            coupon_frequency: None,
            current_market_price: None,
            last_price_update: None,
            ytm: None,
            target_price: None,
            stop_loss: None,
            alert_enabled: None,
            created_at: now,
        }
    }
}

impl SyncEntity for Entry {
    const TABLE: SyncTable = SyncTable::Entries;

    fn id(&self) -> &str {
        &self.id
    }
}

/// A coupon payment received for a bond entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: String,
    pub entry_id: String,
    pub payment_date: i64,
    pub amount: f64,
    pub currency: String,
    pub notes: Option<String>,
    pub created_at: i64,
}

impl Payment {
    pub fn new(entry_id: impl Into<String>, amount: f64, currency: impl Into<String>) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            entry_id: entry_id.into(),
            payment_date: now,
            amount,
            currency: currency.into(),
            notes: None,
            created_at: now,
        }
    }
}

impl SyncEntity for Payment {
    const TABLE: SyncTable = SyncTable::Payments;

    fn id(&self) -> &str {
        &self.id
    }
}
