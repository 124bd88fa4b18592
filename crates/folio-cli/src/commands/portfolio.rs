//! Portfolio command handlers

use anyhow::{Context, Result};

use folio_core::{ChangeTracker, Entry, LocalStore, Portfolio, SyncTable};

use super::resolve_id;
use crate::output::{short_id, Output};
use crate::prompt::confirm;

/// Create a new portfolio
pub fn create(
    tracker: &ChangeTracker,
    name: String,
    description: Option<String>,
    currency: Option<String>,
    output: &Output,
) -> Result<()> {
    let mut portfolio = Portfolio::new(name);
    portfolio.description = description;
    portfolio.base_currency = currency.map(|c| c.to_uppercase());

    tracker
        .create(&portfolio)
        .context("Failed to create portfolio")?;

    output.success(&format!("Created portfolio: {}", portfolio.id));
    output.print_portfolio(&portfolio, &[]);

    Ok(())
}

pub fn list(store: &LocalStore, output: &Output) -> Result<()> {
    let mut portfolios: Vec<Portfolio> = store.list_as()?;
    portfolios.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));

    output.print_portfolios(&portfolios);
    Ok(())
}

/// Show a portfolio with its entries
pub fn show(store: &LocalStore, id: String, output: &Output) -> Result<()> {
    let portfolio = load(store, &id)?;
    let entries: Vec<Entry> = store.children_as(&portfolio.id)?;

    output.print_portfolio(&portfolio, &entries);
    Ok(())
}

pub fn rename(tracker: &ChangeTracker, id: String, name: String, output: &Output) -> Result<()> {
    let mut portfolio = load(tracker.store(), &id)?;
    portfolio.name = name;

    tracker
        .update(&portfolio)
        .context("Failed to update portfolio")?;

    output.success(&format!("Renamed portfolio: {}", portfolio.name));
    Ok(())
}

/// Delete a portfolio together with its entries and their payments
pub fn delete(tracker: &ChangeTracker, id: String, output: &Output) -> Result<()> {
    let store = tracker.store();
    let portfolio = load(store, &id)?;

    if output.should_prompt() {
        let entries = store.children(SyncTable::Entries, &portfolio.id)?;
        println!(
            "Delete portfolio: {} - {}",
            short_id(&portfolio.id),
            portfolio.name
        );
        if !entries.is_empty() {
            println!("This also deletes {} entry(s) and their payments.", entries.len());
        }
        if !confirm("Are you sure?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let removed = tracker
        .delete(SyncTable::Portfolios, &portfolio.id)
        .context("Failed to delete portfolio")?;

    output.success(&format!(
        "Deleted portfolio: {} ({} row(s))",
        portfolio.id, removed
    ));

    Ok(())
}

fn load(store: &LocalStore, id: &str) -> Result<Portfolio> {
    let row_id = resolve_id(store, SyncTable::Portfolios, id)?;
    store
        .get_as(&row_id)?
        .ok_or_else(|| anyhow::anyhow!("Portfolio not found: {}", id))
}
