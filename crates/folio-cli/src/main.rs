//! Folio CLI
//!
//! Command-line interface for Folio - offline-first portfolio tracking.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use folio_core::sync::SessionStore;
use folio_core::{ChangeTracker, Config, LocalStore, StorageError};

mod commands;
mod output;
mod prompt;

use commands::auth::Credentials;
use commands::entry::NewEntry;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "folio")]
#[command(about = "Folio - Offline-first portfolio tracking")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage portfolios
    Portfolio {
        #[command(subcommand)]
        command: PortfolioCommands,
    },
    /// Manage portfolio entries
    Entry {
        #[command(subcommand)]
        command: EntryCommands,
    },
    /// Manage bond coupon payments
    Payment {
        #[command(subcommand)]
        command: PaymentCommands,
    },
    /// Create an account on the sync server
    Register {
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        email: Option<String>,
        /// Password (prompted for when omitted)
        #[arg(long)]
        password: Option<String>,
    },
    /// Log in to the sync server
    Login {
        #[arg(long)]
        email: Option<String>,
        /// Password (prompted for when omitted)
        #[arg(long)]
        password: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Sync with remote server
    Sync,
    /// Show sync status
    Status,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum PortfolioCommands {
    /// Create a new portfolio
    #[command(alias = "add")]
    Create {
        name: String,
        #[arg(short, long)]
        description: Option<String>,
        /// Base currency (e.g. USD)
        #[arg(short, long)]
        currency: Option<String>,
    },
    /// List all portfolios
    #[command(alias = "ls")]
    List,
    /// Show a portfolio and its entries
    Show {
        /// Portfolio ID (full UUID or prefix)
        id: String,
    },
    /// Rename a portfolio
    Rename {
        /// Portfolio ID (full UUID or prefix)
        id: String,
        name: String,
    },
    /// Delete a portfolio with all its entries
    #[command(alias = "rm")]
    Delete {
        /// Portfolio ID (full UUID or prefix)
        id: String,
    },
}

#[derive(Subcommand)]
enum EntryCommands {
    /// Add a holding to a portfolio
    #[command(alias = "add")]
    Create {
        /// Portfolio ID (full UUID or prefix)
        portfolio: String,
        /// Asset type (stock, gold, bond)
        asset_type: String,
        symbol: String,
        quantity: f64,
        /// Purchase price per unit
        price: f64,
        #[arg(short, long)]
        currency: Option<String>,
        /// Purchase date (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        date: Option<String>,
        /// Transaction fees
        #[arg(long)]
        fees: Option<f64>,
        #[arg(short, long)]
        notes: Option<String>,
        /// Tags to add
        #[arg(short, long)]
        tag: Vec<String>,
    },
    /// List entries
    #[command(alias = "ls")]
    List {
        /// Only entries of this portfolio
        #[arg(short, long)]
        portfolio: Option<String>,
    },
    /// Delete an entry and its payments
    #[command(alias = "rm")]
    Delete {
        /// Entry ID (full UUID or prefix)
        id: String,
    },
}

#[derive(Subcommand)]
enum PaymentCommands {
    /// Record a coupon payment for a bond entry
    #[command(alias = "add")]
    Create {
        /// Entry ID (full UUID or prefix)
        entry: String,
        amount: f64,
        #[arg(short, long)]
        currency: Option<String>,
        /// Payment date (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        date: Option<String>,
        #[arg(short, long)]
        notes: Option<String>,
    },
    /// List payments
    #[command(alias = "ls")]
    List {
        /// Only payments of this entry
        #[arg(short, long)]
        entry: Option<String>,
    },
    /// Delete a payment
    #[command(alias = "rm")]
    Delete {
        /// Payment ID (full UUID or prefix)
        id: String,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, server_url, app_id, sync_enabled, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    if let Err(e) = run(cli, &output).await {
        eprintln!("Error: {:#}", e);
        if let Some(hint) = e
            .downcast_ref::<StorageError>()
            .and_then(StorageError::recovery_suggestion)
        {
            eprintln!("Hint: {}", hint);
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli, output: &Output) -> Result<()> {
    let config_path = cli.config.as_ref();

    // Config commands don't need the store
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), config_path, output);
    }

    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    init_logging(&config);

    let command = match cli.command {
        Commands::Register {
            username,
            email,
            password,
        } => {
            let credentials = Credentials {
                username,
                email,
                password,
            };
            return commands::auth::register(&config, credentials, output).await;
        }
        Commands::Login { email, password } => {
            let credentials = Credentials {
                email,
                password,
                ..Credentials::default()
            };
            return commands::auth::login(&config, credentials, output).await;
        }
        Commands::Logout => return commands::auth::logout(&config, output),
        other => other,
    };

    let store = Arc::new(LocalStore::open(&config)?);
    let tracker = ChangeTracker::new(store.clone());

    let is_write = matches!(
        &command,
        Commands::Portfolio {
            command: PortfolioCommands::Create { .. }
                | PortfolioCommands::Rename { .. }
                | PortfolioCommands::Delete { .. }
        } | Commands::Entry {
            command: EntryCommands::Create { .. } | EntryCommands::Delete { .. }
        } | Commands::Payment {
            command: PaymentCommands::Create { .. } | PaymentCommands::Delete { .. }
        }
    );
    let is_read = !is_write && !matches!(&command, Commands::Sync | Commands::Status);

    // Sync before read commands (to get latest data)
    if is_read {
        auto_sync(&store, &config, output).await;
    }

    let result = match command {
        Commands::Portfolio { command } => handle_portfolio_command(command, &tracker, output),
        Commands::Entry { command } => handle_entry_command(command, &tracker, output),
        Commands::Payment { command } => handle_payment_command(command, &tracker, output),
        Commands::Sync => commands::sync::sync(store.clone(), &config, output).await,
        Commands::Status => commands::status::show(&store, &config, output),
        Commands::Register { .. }
        | Commands::Login { .. }
        | Commands::Logout
        | Commands::Config { .. } => unreachable!(), // Handled above
    };

    // Sync after write commands (to push changes)
    if is_write && result.is_ok() {
        auto_sync(&store, &config, output).await;
    }

    result
}

fn handle_portfolio_command(
    command: PortfolioCommands,
    tracker: &ChangeTracker,
    output: &Output,
) -> Result<()> {
    let store = tracker.store();
    match command {
        PortfolioCommands::Create {
            name,
            description,
            currency,
        } => commands::portfolio::create(tracker, name, description, currency, output),
        PortfolioCommands::List => commands::portfolio::list(store, output),
        PortfolioCommands::Show { id } => commands::portfolio::show(store, id, output),
        PortfolioCommands::Rename { id, name } => {
            commands::portfolio::rename(tracker, id, name, output)
        }
        PortfolioCommands::Delete { id } => commands::portfolio::delete(tracker, id, output),
    }
}

fn handle_entry_command(
    command: EntryCommands,
    tracker: &ChangeTracker,
    output: &Output,
) -> Result<()> {
    match command {
        EntryCommands::Create {
            portfolio,
            asset_type,
            symbol,
            quantity,
            price,
            currency,
            date,
            fees,
            notes,
            tag,
        } => {
            let new_entry = NewEntry {
                asset_type,
                symbol,
                quantity,
                price,
                currency,
                date,
                fees,
                notes,
                tags: tag,
            };
            commands::entry::create(tracker, portfolio, new_entry, output)
        }
        EntryCommands::List { portfolio } => {
            commands::entry::list(tracker.store(), portfolio, output)
        }
        EntryCommands::Delete { id } => commands::entry::delete(tracker, id, output),
    }
}

fn handle_payment_command(
    command: PaymentCommands,
    tracker: &ChangeTracker,
    output: &Output,
) -> Result<()> {
    match command {
        PaymentCommands::Create {
            entry,
            amount,
            currency,
            date,
            notes,
        } => commands::payment::create(tracker, entry, amount, currency, date, notes, output),
        PaymentCommands::List { entry } => {
            commands::payment::list(tracker.store(), entry, output)
        }
        PaymentCommands::Delete { id } => commands::payment::delete(tracker, id, output),
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

/// Initialize logging
///
/// Level comes from FOLIO_LOG (default `warn`). Logs go to `config.log_file`
/// when set, otherwise to stderr.
fn init_logging(config: &Config) {
    let log_level = std::env::var("FOLIO_LOG").unwrap_or_else(|_| "warn".to_string());
    let env_filter = EnvFilter::new(format!("folio_core={},folio_cli={}", log_level, log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    match config.log_file.as_ref() {
        Some(log_path) => {
            let log_file = match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
            {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
                    return;
                }
            };
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(log_file))
                .try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}

/// Auto-sync if sync is enabled and a session exists, silently handles errors
async fn auto_sync(store: &Arc<LocalStore>, config: &Config, output: &Output) {
    if !config.sync_enabled || config.server_url.is_none() || config.app_id.is_none() {
        return;
    }

    let logged_in = SessionStore::with_path(config.session_path())
        .map(|session| session.is_authenticated())
        .unwrap_or(false);
    if !logged_in {
        return;
    }

    // Sync silently (errors shown only in non-quiet mode)
    if let Err(e) = commands::sync::sync_quiet(store.clone(), config).await {
        if !output.is_quiet() {
            eprintln!("⚠ Auto-sync failed: {}", e);
        }
    }
}
