//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use chrono::{DateTime, Utc};
use serde::Serialize;

use folio_core::sync::{SyncResult, SyncStatus};
use folio_core::{Entry, Payment, Portfolio};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print any serializable value as pretty JSON
    pub fn print_json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to serialize output: {}", e),
        }
    }

    pub fn print_portfolio(&self, portfolio: &Portfolio, entries: &[Entry]) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:          {}", portfolio.id);
                println!("Name:        {}", portfolio.name);
                if let Some(ref desc) = portfolio.description {
                    println!("Description: {}", desc);
                }
                if let Some(ref currency) = portfolio.base_currency {
                    println!("Currency:    {}", currency);
                }
                println!("Created:     {}", format_timestamp(portfolio.created_at));

                if !entries.is_empty() {
                    println!();
                    println!("── Entries ({}) ──", entries.len());
                    for entry in entries {
                        println!("{}", entry_line(entry));
                    }
                }
            }
            OutputFormat::Json => {
                self.print_json(&serde_json::json!({
                    "portfolio": portfolio,
                    "entries": entries,
                }));
            }
            OutputFormat::Quiet => {
                println!("{}", portfolio.id);
            }
        }
    }

    pub fn print_portfolios(&self, portfolios: &[Portfolio]) {
        match self.format {
            OutputFormat::Human => {
                if portfolios.is_empty() {
                    println!("No portfolios found.");
                    return;
                }
                for portfolio in portfolios {
                    println!(
                        "{} | {} | {}",
                        short_id(&portfolio.id),
                        truncate(&portfolio.name, 40),
                        portfolio.base_currency.as_deref().unwrap_or("-")
                    );
                }
                println!("\n{} portfolio(s)", portfolios.len());
            }
            OutputFormat::Json => self.print_json(portfolios),
            OutputFormat::Quiet => {
                for portfolio in portfolios {
                    println!("{}", portfolio.id);
                }
            }
        }
    }

    pub fn print_entries(&self, entries: &[Entry]) {
        match self.format {
            OutputFormat::Human => {
                if entries.is_empty() {
                    println!("No entries found.");
                    return;
                }
                for entry in entries {
                    println!("{}", entry_line(entry));
                }
                println!("\n{} entry(s)", entries.len());
            }
            OutputFormat::Json => self.print_json(entries),
            OutputFormat::Quiet => {
                for entry in entries {
                    println!("{}", entry.id);
                }
            }
        }
    }

    pub fn print_payments(&self, payments: &[Payment]) {
        match self.format {
            OutputFormat::Human => {
                if payments.is_empty() {
                    println!("No payments found.");
                    return;
                }
                for payment in payments {
                    println!(
                        "{} | {} | {:.2} {}",
                        short_id(&payment.id),
                        format_date(payment.payment_date),
                        payment.amount,
                        payment.currency
                    );
                }
                println!("\n{} payment(s)", payments.len());
            }
            OutputFormat::Json => self.print_json(payments),
            OutputFormat::Quiet => {
                for payment in payments {
                    println!("{}", payment.id);
                }
            }
        }
    }

    /// Print the outcome of a sync cycle
    pub fn print_sync_result(&self, result: &SyncResult) {
        match self.format {
            OutputFormat::Human => {
                if result.success {
                    println!(
                        "✓ Sync complete - pushed {}, pulled {}",
                        result.pushed, result.pulled
                    );
                    if result.conflicts > 0 {
                        println!(
                            "  {} change(s) rejected by the server",
                            result.conflicts
                        );
                    }
                } else {
                    println!(
                        "Sync failed: {}",
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            OutputFormat::Json => self.print_json(result),
            OutputFormat::Quiet => {}
        }
    }

    pub fn print_status(
        &self,
        status: &SyncStatus,
        user_id: Option<&str>,
        server_url: Option<&str>,
        enabled: bool,
    ) {
        match self.format {
            OutputFormat::Json => {
                self.print_json(&serde_json::json!({
                    "sync_enabled": enabled,
                    "server_url": server_url,
                    "authenticated": status.authenticated,
                    "user_id": user_id,
                    "phase": status.phase,
                    "last_sync_at": status.last_sync_at,
                    "pending_changes": status.pending_changes,
                    "checkpoint": status.checkpoint.as_ref().map(|c| &c.0),
                }));
            }
            OutputFormat::Quiet => {
                println!("{}", status.pending_changes);
            }
            OutputFormat::Human => {
                println!("Folio Status");
                println!("============");
                println!();
                println!("Sync:");
                println!(
                    "  Status:    {}",
                    if enabled { "enabled" } else { "disabled" }
                );
                println!("  Server:    {}", server_url.unwrap_or("(not set)"));
                println!(
                    "  Logged in: {}",
                    if status.authenticated { "yes" } else { "no" }
                );
                if let Some(user_id) = user_id {
                    println!("  User:      {}", user_id);
                }
                println!(
                    "  Last sync: {}",
                    status
                        .last_sync_at
                        .map(format_millis)
                        .unwrap_or_else(|| "never".to_string())
                );
                println!("  Pending:   {} change(s)", status.pending_changes);
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn entry_line(entry: &Entry) -> String {
    format!(
        "{} | {:<5} | {:<10} | {} @ {:.2}{}",
        short_id(&entry.id),
        entry.asset_type.as_str(),
        truncate(&entry.symbol, 10),
        entry.quantity,
        entry.purchase_price,
        entry
            .currency
            .as_deref()
            .map(|c| format!(" {}", c))
            .unwrap_or_default()
    )
}

/// First eight characters of an id
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Format seconds since the epoch
fn format_timestamp(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn format_date(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// Format milliseconds since the epoch
fn format_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ééééééééééééé", 5), "éé...");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_format_timestamps() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00");
        assert_eq!(format_date(86_400), "1970-01-02");
        assert_eq!(format_millis(1_000), "1970-01-01 00:00:01 UTC");
    }
}
