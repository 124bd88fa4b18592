//! Command handlers

pub mod auth;
pub mod config;
pub mod entry;
pub mod payment;
pub mod portfolio;
pub mod status;
pub mod sync;

use anyhow::{bail, Result};

use folio_core::{LocalStore, SyncTable};

/// Resolve a full id or unique id prefix to the stored row id
pub(crate) fn resolve_id(store: &LocalStore, table: SyncTable, id: &str) -> Result<String> {
    if store.get(table, id)?.is_some() {
        return Ok(id.to_string());
    }

    let matches: Vec<String> = store
        .list(table)?
        .into_iter()
        .map(|record| record.id)
        .filter(|row_id| row_id.starts_with(id))
        .collect();

    match matches.as_slice() {
        [] => bail!("No {} found matching: {}", singular(table), id),
        [only] => Ok(only.clone()),
        _ => {
            eprintln!("Multiple {} match '{}':", table, id);
            for row_id in &matches {
                eprintln!("  {}", row_id);
            }
            bail!("Ambiguous ID. Please provide more characters.");
        }
    }
}

pub(crate) fn singular(table: SyncTable) -> &'static str {
    match table {
        SyncTable::Portfolios => "portfolio",
        SyncTable::Entries => "entry",
        SyncTable::Payments => "payment",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{ChangeTracker, Portfolio};
    use std::sync::Arc;

    fn store_with(names: &[(&str, &str)]) -> Arc<LocalStore> {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let tracker = ChangeTracker::new(store.clone());
        for (id, name) in names {
            let mut portfolio = Portfolio::new(*name);
            portfolio.id = id.to_string();
            tracker.create(&portfolio).unwrap();
        }
        store
    }

    #[test]
    fn test_resolve_full_id() {
        let store = store_with(&[("abc-1", "One")]);
        assert_eq!(
            resolve_id(&store, SyncTable::Portfolios, "abc-1").unwrap(),
            "abc-1"
        );
    }

    #[test]
    fn test_resolve_unique_prefix() {
        let store = store_with(&[("abc-1", "One"), ("def-2", "Two")]);
        assert_eq!(
            resolve_id(&store, SyncTable::Portfolios, "de").unwrap(),
            "def-2"
        );
    }

    #[test]
    fn test_resolve_ambiguous_or_missing() {
        let store = store_with(&[("abc-1", "One"), ("abc-2", "Two")]);
        let err = resolve_id(&store, SyncTable::Portfolios, "abc").unwrap_err();
        assert!(err.to_string().contains("Ambiguous"));

        let err = resolve_id(&store, SyncTable::Portfolios, "zzz").unwrap_err();
        assert!(err.to_string().contains("No portfolio found"));
    }
}
