//! Sync command handlers

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::debug;

use folio_core::sync::{
    ApiRetryClass, SessionStore, SyncEvent, SyncPhase, SyncProtocolClient, SyncResult,
};
use folio_core::{Config, FieldMapper, LocalStore, SyncOrchestrator};

use crate::output::{Output, OutputFormat};

/// Build an orchestrator talking to the configured server
pub fn orchestrator(config: &Config, store: Arc<LocalStore>) -> Result<SyncOrchestrator> {
    let session = Arc::new(
        SessionStore::with_path(config.session_path()).context("Failed to load session")?,
    );
    let client = SyncProtocolClient::from_config(config, session)?;

    Ok(SyncOrchestrator::new(store, Arc::new(client))
        .with_mapper(FieldMapper::new(config.protocol_version))
        .with_batch_size(config.pull_batch_size))
}

/// Sync with the remote server
pub async fn sync(store: Arc<LocalStore>, config: &Config, output: &Output) -> Result<()> {
    if !config.sync_enabled {
        bail!(
            "Sync is not enabled. Enable it with:\n  \
             folio config set sync_enabled true\n  \
             folio config set server_url https://your-server/api/v1\n  \
             folio config set app_id your-app-id"
        );
    }

    let mut orchestrator = orchestrator(config, store)?;

    output.message("Syncing with server...");

    let events = orchestrator.take_events();
    let verbose = output.format == OutputFormat::Human;
    let printer = events.map(|mut rx| {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    SyncEvent::Progress(progress) if verbose => {
                        println!(
                            "  pushed {}, pulled {}{}",
                            progress.pushed,
                            progress.pulled,
                            if progress.has_more { " ..." } else { "" }
                        );
                    }
                    other => debug!(?other, "sync event"),
                }
            }
        })
    });

    let phases = verbose.then(|| {
        let mut rx = orchestrator.subscribe_phase();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let phase = *rx.borrow_and_update();
                if let Some(label) = phase_label(phase) {
                    println!("  {}", label);
                }
            }
        })
    });

    let result = orchestrator.run().await;

    // Dropping the orchestrator closes the event and phase channels
    drop(orchestrator);
    for task in printer.into_iter().chain(phases) {
        let _ = task.await;
    }

    output.print_sync_result(&result);
    into_outcome(result)
}

/// Sync quietly (for auto-sync) - no output on success
pub async fn sync_quiet(store: Arc<LocalStore>, config: &Config) -> Result<()> {
    let orchestrator = orchestrator(config, store)?;
    into_outcome(orchestrator.run().await)
}

fn into_outcome(result: SyncResult) -> Result<()> {
    if result.success {
        return Ok(());
    }

    let error = result
        .error
        .unwrap_or_else(|| "Sync failed".to_string());
    match result.retry.and_then(retry_hint) {
        Some(hint) => bail!("{}\nHint: {}", error, hint),
        None => bail!("{}", error),
    }
}

fn retry_hint(retry: ApiRetryClass) -> Option<&'static str> {
    match retry {
        ApiRetryClass::ReauthRequired => Some("Run `folio login` to sign in again."),
        ApiRetryClass::Retryable => Some("The server could not be reached; try again later."),
        ApiRetryClass::Permanent => None,
    }
}

fn phase_label(phase: SyncPhase) -> Option<&'static str> {
    match phase {
        SyncPhase::Authenticating => Some("signing in..."),
        SyncPhase::Pushing => Some("pushing local changes..."),
        SyncPhase::Pulling => Some("pulling remote changes..."),
        SyncPhase::Committing => Some("saving..."),
        SyncPhase::Idle | SyncPhase::Applying | SyncPhase::Error => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(error: &str, retry: Option<ApiRetryClass>) -> SyncResult {
        SyncResult {
            success: false,
            error: Some(error.to_string()),
            retry,
            ..SyncResult::default()
        }
    }

    #[test]
    fn test_reauth_failure_suggests_login() {
        let err = into_outcome(failed("Not logged in", Some(ApiRetryClass::ReauthRequired)))
            .unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("Not logged in"));
        assert!(message.contains("folio login"));
    }

    #[test]
    fn test_permanent_failure_has_no_hint() {
        let err = into_outcome(failed("Protocol error: bad page", Some(ApiRetryClass::Permanent)))
            .unwrap_err();
        assert_eq!(err.to_string(), "Protocol error: bad page");
    }

    #[test]
    fn test_successful_result_is_ok() {
        let result = SyncResult {
            success: true,
            ..SyncResult::default()
        };
        assert!(into_outcome(result).is_ok());
    }
}
