//! Field mapping between local rows and wire records
//!
//! The server speaks camelCase and names foreign keys after the parent's
//! sync id (`portfolioSyncUuid`, `entrySyncUuid`). Locally every column is
//! snake_case. All renaming happens here, driven by one alias table per
//! synchronized table; fields without an alias keep their name in both
//! directions.
//!
//! Bump [`MAPPER_VERSION`] whenever an alias is added or changed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{LocalPatch, LocalRecord, PendingChange, SyncTable};
use crate::sync::SyncRecord;

/// Version of the alias tables below
pub const MAPPER_VERSION: u32 = 2;

/// Wire naming used for table names
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// Local (snake_case) table names
    V1,
    /// camelCase table names
    #[default]
    V2,
}

/// (local, wire) pairs
type Aliases = &'static [(&'static str, &'static str)];

const PORTFOLIO_ALIASES: Aliases = &[
    ("base_currency", "baseCurrency"),
    ("created_at", "createdAt"),
];

const ENTRY_ALIASES: Aliases = &[
    ("portfolio_id", "portfolioSyncUuid"),
    ("asset_type", "assetType"),
    ("purchase_price", "purchasePrice"),
    ("purchase_date", "purchaseDate"),
    ("transaction_fees", "transactionFees"),
    ("gold_type", "goldType"),
    ("face_value", "faceValue"),
    ("coupon_rate", "couponRate"),
    ("maturity_date", "maturityDate"),
    ("coupon_frequency", "couponFrequency"),
    ("current_market_price", "currentMarketPrice"),
    ("last_price_update", "lastPriceUpdate"),
    ("target_price", "targetPrice"),
    ("stop_loss", "stopLoss"),
    ("alert_enabled", "alertEnabled"),
    ("created_at", "createdAt"),
];

const PAYMENT_ALIASES: Aliases = &[
    ("entry_id", "entrySyncUuid"),
    ("payment_date", "paymentDate"),
    ("created_at", "createdAt"),
];

fn aliases(table: SyncTable) -> Aliases {
    match table {
        SyncTable::Portfolios => PORTFOLIO_ALIASES,
        SyncTable::Entries => ENTRY_ALIASES,
        SyncTable::Payments => PAYMENT_ALIASES,
    }
}

fn wire_table_v2(table: SyncTable) -> &'static str {
    match table {
        SyncTable::Portfolios => "portfolios",
        SyncTable::Entries => "portfolioEntries",
        SyncTable::Payments => "bondCouponPayments",
    }
}

/// Translates rows to and from the server's record format
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMapper {
    protocol: ProtocolVersion,
}

impl FieldMapper {
    pub fn new(protocol: ProtocolVersion) -> Self {
        Self { protocol }
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Table name to send for `table`
    pub fn table_to_wire(&self, table: SyncTable) -> &'static str {
        match self.protocol {
            ProtocolVersion::V1 => table.name(),
            ProtocolVersion::V2 => wire_table_v2(table),
        }
    }

    /// Local table name for a wire table name
    ///
    /// Both spellings are accepted. Unknown names come back unchanged so the
    /// store can report and skip them.
    pub fn table_to_local(&self, wire: &str) -> String {
        SyncTable::ALL
            .into_iter()
            .find(|t| t.name() == wire || wire_table_v2(*t) == wire)
            .map(|t| t.name().to_string())
            .unwrap_or_else(|| wire.to_string())
    }

    /// Map a local row to a wire record, dropping null fields
    pub fn to_wire(&self, record: &LocalRecord) -> SyncRecord {
        let aliases = aliases(record.table);
        let mut data = Map::new();

        for (name, value) in &record.fields {
            if value.is_null() {
                continue;
            }
            let wire = aliases
                .iter()
                .find(|(local, _)| *local == name.as_str())
                .map(|(_, wire)| (*wire).to_string())
                .unwrap_or_else(|| name.clone());
            data.insert(wire, value.clone());
        }

        SyncRecord {
            table_name: self.table_to_wire(record.table).to_string(),
            row_id: record.id.clone(),
            data: Value::Object(data),
            version: record.sync_version,
            deleted: false,
        }
    }

    /// Tombstone for a logged delete
    pub fn delete_to_wire(&self, change: &PendingChange) -> SyncRecord {
        let table_name = SyncTable::from_name(&change.table_name)
            .map(|t| self.table_to_wire(t).to_string())
            .unwrap_or_else(|| change.table_name.clone());

        SyncRecord {
            table_name,
            row_id: change.row_id.clone(),
            data: Value::Object(Map::new()),
            version: change.version,
            deleted: true,
        }
    }

    /// Map a wire record to local naming
    ///
    /// Records for unknown tables keep their fields as-is.
    pub fn to_local(&self, record: SyncRecord) -> LocalPatch {
        let table_name = self.table_to_local(&record.table_name);
        let aliases = SyncTable::from_name(&table_name).map(aliases).unwrap_or_default();

        let data = match record.data {
            Value::Object(data) => data,
            _ => Map::new(),
        };

        let mut fields = Map::new();
        let mut mapped = Vec::new();
        for (name, value) in data {
            match aliases.iter().find(|(_, wire)| *wire == name.as_str()) {
                Some((local, _)) => mapped.push((local.to_string(), value)),
                None => {
                    fields.insert(name, value);
                }
            }
        }
        // An aliased name wins over a stray field already using the local name
        fields.extend(mapped);

        LocalPatch {
            table_name,
            row_id: record.row_id,
            version: record.version,
            deleted: record.deleted,
            fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetType, Entry, Payment, Portfolio, SyncEntity};
    use serde_json::json;
    use std::collections::HashSet;

    fn record<E: SyncEntity>(entity: &E) -> LocalRecord {
        LocalRecord {
            table: E::TABLE,
            id: entity.id().to_string(),
            sync_version: 3,
            synced_at: None,
            fields: entity.to_fields().unwrap(),
        }
    }

    #[test]
    fn test_aliases_are_unique() {
        for table in SyncTable::ALL {
            let aliases = aliases(table);
            let locals: HashSet<_> = aliases.iter().map(|(l, _)| l).collect();
            let wires: HashSet<_> = aliases.iter().map(|(_, w)| w).collect();
            assert_eq!(locals.len(), aliases.len(), "{table}");
            assert_eq!(wires.len(), aliases.len(), "{table}");
        }
    }

    #[test]
    fn test_aliases_name_real_columns() {
        for table in SyncTable::ALL {
            for (local, _) in aliases(table) {
                assert!(
                    table.columns().iter().any(|c| c.name == *local),
                    "{table}.{local}"
                );
            }
        }
    }

    #[test]
    fn test_to_wire_renames_foreign_keys() {
        let mapper = FieldMapper::default();
        let mut entry = Entry::new("p-1", AssetType::Bond, "GB10Y", 10.0, 99.5);
        entry.coupon_rate = Some(4.5);

        let wire = mapper.to_wire(&record(&entry));
        assert_eq!(wire.table_name, "portfolioEntries");
        assert_eq!(wire.version, 3);
        assert!(!wire.deleted);
        assert_eq!(wire.data["portfolioSyncUuid"], json!("p-1"));
        assert_eq!(wire.data["couponRate"], json!(4.5));
        assert_eq!(wire.data["symbol"], json!("GB10Y"));
        assert!(wire.data.get("portfolio_id").is_none());
        // Nulls are dropped
        assert!(wire.data.get("notes").is_none());
        assert!(wire.data.get("faceValue").is_none());
    }

    #[test]
    fn test_round_trip_preserves_mapped_fields() {
        let mapper = FieldMapper::default();
        let mut portfolio = Portfolio::new("Main");
        portfolio.base_currency = Some("EUR".to_string());
        let mut entry = Entry::new(&portfolio.id, AssetType::Gold, "XAU", 2.0, 1900.0);
        entry.alert_enabled = Some(true);
        let payment = Payment::new(&entry.id, 12.5, "USD");

        for local in [record(&portfolio), record(&entry), record(&payment)] {
            let patch = mapper.to_local(mapper.to_wire(&local));
            assert_eq!(patch.table(), Some(local.table));
            assert_eq!(patch.row_id, local.id);
            assert_eq!(patch.version, local.sync_version);

            let expected: Map<String, Value> = local
                .fields
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            assert_eq!(patch.fields, expected);
        }
    }

    #[test]
    fn test_unknown_fields_pass_through() {
        let mapper = FieldMapper::default();
        let wire = SyncRecord {
            table_name: "bondCouponPayments".to_string(),
            row_id: "pay-1".to_string(),
            data: json!({
                "entrySyncUuid": "e-1",
                "amount": 3.0,
                "withholdingTax": 0.45
            }),
            version: 2,
            deleted: false,
        };

        let patch = mapper.to_local(wire);
        assert_eq!(patch.table_name, "bond_coupon_payments");
        assert_eq!(patch.fields["entry_id"], json!("e-1"));
        assert_eq!(patch.fields["withholdingTax"], json!(0.45));

        let back = mapper.to_wire(&LocalRecord {
            table: SyncTable::Payments,
            id: patch.row_id.clone(),
            sync_version: patch.version,
            synced_at: None,
            fields: patch.fields,
        });
        assert_eq!(back.data["withholdingTax"], json!(0.45));
        assert_eq!(back.data["entrySyncUuid"], json!("e-1"));
    }

    #[test]
    fn test_accepts_both_table_spellings() {
        let mapper = FieldMapper::new(ProtocolVersion::V2);
        assert_eq!(mapper.table_to_local("portfolio_entries"), "portfolio_entries");
        assert_eq!(mapper.table_to_local("portfolioEntries"), "portfolio_entries");
        assert_eq!(mapper.table_to_local("watchlists"), "watchlists");
    }

    #[test]
    fn test_v1_sends_local_table_names() {
        let mapper = FieldMapper::new(ProtocolVersion::V1);
        let payment = Payment::new("e-1", 1.0, "USD");

        let wire = mapper.to_wire(&record(&payment));
        assert_eq!(wire.table_name, "bond_coupon_payments");
        assert_eq!(wire.data["entrySyncUuid"], json!("e-1"));
    }

    #[test]
    fn test_delete_to_wire() {
        let mapper = FieldMapper::default();
        let change = PendingChange {
            id: 7,
            table_name: "portfolio_entries".to_string(),
            row_id: "e-1".to_string(),
            operation: crate::models::ChangeOperation::Delete,
            data: Some(json!({"symbol": "AAPL"})),
            version: 5,
            created_at: 0,
        };

        let wire = mapper.delete_to_wire(&change);
        assert_eq!(wire.table_name, "portfolioEntries");
        assert!(wire.deleted);
        assert_eq!(wire.version, 5);
        assert_eq!(wire.data, json!({}));
    }

    #[test]
    fn test_non_object_data_is_empty() {
        let mapper = FieldMapper::default();
        let patch = mapper.to_local(SyncRecord {
            table_name: "portfolios".to_string(),
            row_id: "p-1".to_string(),
            data: Value::Null,
            version: 1,
            deleted: true,
        });
        assert!(patch.fields.is_empty());
        assert!(patch.deleted);
    }
}
