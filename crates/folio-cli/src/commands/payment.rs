//! Payment command handlers

use anyhow::{bail, Context, Result};

use folio_core::{AssetType, ChangeTracker, Entry, LocalStore, Payment, SyncTable};

use super::entry::parse_date;
use super::resolve_id;
use crate::output::Output;
use crate::prompt::confirm;

/// Record a coupon payment against a bond entry
pub fn create(
    tracker: &ChangeTracker,
    entry: String,
    amount: f64,
    currency: Option<String>,
    date: Option<String>,
    notes: Option<String>,
    output: &Output,
) -> Result<()> {
    let entry_id = resolve_id(tracker.store(), SyncTable::Entries, &entry)?;
    let entry: Entry = tracker
        .store()
        .get_as(&entry_id)?
        .ok_or_else(|| anyhow::anyhow!("Entry not found: {}", entry_id))?;

    if entry.asset_type != AssetType::Bond {
        bail!(
            "Payments can only be recorded for bond entries ({} is a {})",
            entry.symbol,
            entry.asset_type.as_str()
        );
    }

    let currency = currency
        .or_else(|| entry.currency.clone())
        .unwrap_or_else(|| "USD".to_string());

    let mut payment = Payment::new(&entry.id, amount, currency.to_uppercase());
    payment.notes = notes;
    if let Some(date) = date {
        payment.payment_date = parse_date(&date)?;
    }

    tracker
        .create(&payment)
        .context("Failed to record payment")?;

    output.success(&format!("Recorded payment: {}", payment.id));

    Ok(())
}

/// List payments of one entry, or all payments
pub fn list(store: &LocalStore, entry: Option<String>, output: &Output) -> Result<()> {
    let mut payments: Vec<Payment> = match entry {
        Some(ref e) => {
            let entry_id = resolve_id(store, SyncTable::Entries, e)?;
            store.children_as(&entry_id)?
        }
        None => store.list_as()?,
    };
    payments.sort_by_key(|p| p.payment_date);

    output.print_payments(&payments);
    Ok(())
}

pub fn delete(tracker: &ChangeTracker, id: String, output: &Output) -> Result<()> {
    let payment_id = resolve_id(tracker.store(), SyncTable::Payments, &id)?;

    if output.should_prompt() && !confirm(&format!("Delete payment {}?", payment_id))? {
        println!("Cancelled.");
        return Ok(());
    }

    tracker
        .delete(SyncTable::Payments, &payment_id)
        .context("Failed to delete payment")?;

    output.success(&format!("Deleted payment: {}", payment_id));

    Ok(())
}
