//! Entry command handlers

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;

use folio_core::{AssetType, ChangeTracker, Entry, LocalStore, SyncTable};

use super::resolve_id;
use crate::output::{short_id, Output};
use crate::prompt::confirm;

/// Values for a new entry as given on the command line
#[derive(Debug)]
pub struct NewEntry {
    pub asset_type: String,
    pub symbol: String,
    pub quantity: f64,
    pub price: f64,
    pub currency: Option<String>,
    pub date: Option<String>,
    pub fees: Option<f64>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
}

pub fn create(
    tracker: &ChangeTracker,
    portfolio: String,
    options: NewEntry,
    output: &Output,
) -> Result<()> {
    let portfolio_id = resolve_id(tracker.store(), SyncTable::Portfolios, &portfolio)?;
    let asset_type: AssetType = options.asset_type.parse().map_err(anyhow::Error::msg)?;

    if options.quantity <= 0.0 {
        bail!("Quantity must be positive");
    }
    if options.price < 0.0 {
        bail!("Price cannot be negative");
    }

    let mut entry = Entry::new(
        portfolio_id,
        asset_type,
        options.symbol.to_uppercase(),
        options.quantity,
        options.price,
    );
    entry.currency = options.currency.map(|c| c.to_uppercase());
    entry.transaction_fees = options.fees;
    entry.notes = options.notes;
    if !options.tags.is_empty() {
        entry.tags = Some(options.tags.join(","));
    }
    if let Some(date) = options.date {
        entry.purchase_date = parse_date(&date)?;
    }

    tracker.create(&entry).context("Failed to create entry")?;

    output.success(&format!("Created entry: {}", entry.id));
    if output.is_json() {
        output.print_json(&entry);
    }

    Ok(())
}

/// List entries, optionally only those of one portfolio
pub fn list(store: &LocalStore, portfolio: Option<String>, output: &Output) -> Result<()> {
    let entries: Vec<Entry> = match portfolio {
        Some(ref p) => {
            let portfolio_id = resolve_id(store, SyncTable::Portfolios, p)?;
            store.children_as(&portfolio_id)?
        }
        None => store.list_as()?,
    };

    output.print_entries(&entries);
    Ok(())
}

/// Delete an entry and its payments
pub fn delete(tracker: &ChangeTracker, id: String, output: &Output) -> Result<()> {
    let entry_id = resolve_id(tracker.store(), SyncTable::Entries, &id)?;
    let entry: Entry = tracker
        .store()
        .get_as(&entry_id)?
        .ok_or_else(|| anyhow::anyhow!("Entry not found: {}", id))?;

    if output.should_prompt() {
        println!(
            "Delete entry: {} - {} {}",
            short_id(&entry.id),
            entry.quantity,
            entry.symbol
        );
        if !confirm("Are you sure?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    tracker
        .delete(SyncTable::Entries, &entry.id)
        .context("Failed to delete entry")?;

    output.success(&format!("Deleted entry: {}", entry.id));

    Ok(())
}

/// Parse a `YYYY-MM-DD` date into seconds since the epoch (UTC midnight)
pub(crate) fn parse_date(value: &str) -> Result<i64> {
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}'. Use YYYY-MM-DD.", value))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow::anyhow!("Invalid date: {}", value))?;
    Ok(midnight.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date() {
        assert_eq!(parse_date("1970-01-02").unwrap(), 86_400);
        assert!(parse_date("02/01/1970").is_err());
        assert!(parse_date("2024-13-01").is_err());
    }
}
