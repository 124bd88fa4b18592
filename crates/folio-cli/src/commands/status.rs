//! Status command handler

use anyhow::Result;

use folio_core::sync::{SessionStore, SyncPhase, SyncStatus};
use folio_core::{Config, LocalStore};

use crate::output::Output;

/// Show sync status
///
/// Works without a configured server; only local state is read.
pub fn show(store: &LocalStore, config: &Config, output: &Output) -> Result<()> {
    let session = SessionStore::with_path(config.session_path())?;

    let status = SyncStatus {
        authenticated: session.is_authenticated(),
        phase: SyncPhase::Idle,
        last_sync_at: store.last_sync_at()?,
        pending_changes: store.pending_change_count()?,
        checkpoint: store.checkpoint()?,
    };

    let tokens = session.tokens();
    output.print_status(
        &status,
        tokens.user_id.as_deref(),
        config.server_url.as_deref(),
        config.sync_enabled,
    );
    Ok(())
}
