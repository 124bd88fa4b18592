//! Account command handlers

use std::sync::Arc;

use anyhow::{Context, Result};

use folio_core::sync::{SessionStore, SyncProtocolClient};
use folio_core::Config;

use crate::output::Output;
use crate::prompt::read_value;

/// Credentials as given on the command line; missing ones are prompted for
#[derive(Debug, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

fn client(config: &Config) -> Result<SyncProtocolClient> {
    let session = Arc::new(
        SessionStore::with_path(config.session_path()).context("Failed to load session")?,
    );
    Ok(SyncProtocolClient::from_config(config, session)?)
}

pub async fn register(config: &Config, credentials: Credentials, output: &Output) -> Result<()> {
    let client = client(config)?;

    let username = value_or_prompt(credentials.username, "Username")?;
    let email = value_or_prompt(credentials.email, "Email")?;
    let password = value_or_prompt(credentials.password, "Password")?;

    let response = client.register(&username, &email, &password).await?;

    output.success(&format!(
        "Registered {}{}",
        email,
        response
            .user_id
            .map(|id| format!(" (user {})", id))
            .unwrap_or_default()
    ));
    Ok(())
}

pub async fn login(config: &Config, credentials: Credentials, output: &Output) -> Result<()> {
    let client = client(config)?;

    let email = value_or_prompt(credentials.email, "Email")?;
    let password = value_or_prompt(credentials.password, "Password")?;

    client.login(&email, &password).await?;

    output.success(&format!("Logged in as {}", email));
    Ok(())
}

/// Forget the stored session tokens
pub fn logout(config: &Config, output: &Output) -> Result<()> {
    let session = SessionStore::with_path(config.session_path())?;

    if !session.is_authenticated() {
        output.message("Not logged in.");
        return Ok(());
    }

    session.clear().context("Failed to remove session")?;
    output.success("Logged out");
    Ok(())
}

fn value_or_prompt(value: Option<String>, prompt: &str) -> Result<String> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        _ => read_value(prompt),
    }
}
