//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use folio_core::{Config, ProtocolVersion};

use crate::output::{Output, OutputFormat};

const VALID_KEYS: &str = "data_dir, server_url, app_id, api_key, sync_enabled, \
                          pull_batch_size, request_timeout_secs, protocol_version, log_file";

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "server_url": config.server_url,
                    "app_id": config.app_id,
                    "api_key": config.api_key.as_ref().map(|_| "********"),
                    "sync_enabled": config.sync_enabled,
                    "pull_batch_size": config.pull_batch_size,
                    "request_timeout_secs": config.request_timeout_secs,
                    "protocol_version": config.protocol_version,
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:             {}", config.data_dir.display());
            println!(
                "  server_url:           {}",
                config.server_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  app_id:               {}",
                config.app_id.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  api_key:              {}",
                if config.api_key.is_some() {
                    "(set)"
                } else {
                    "(not set)"
                }
            );
            println!("  sync_enabled:         {}", config.sync_enabled);
            println!("  pull_batch_size:      {}", config.pull_batch_size);
            println!("  request_timeout_secs: {}", config.request_timeout_secs);
            println!(
                "  protocol_version:     {}",
                protocol_name(config.protocol_version)
            );
            println!(
                "  log_file:             {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    let shown = if key == "api_key" { "********" } else { &value };
    output.success(&format!("Set {} = {}", key, shown));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => {
            config.data_dir = value.into();
        }
        "server_url" => {
            config.server_url = optional(value);
        }
        "app_id" => {
            config.app_id = optional(value);
        }
        "api_key" => {
            config.api_key = optional(value);
        }
        "sync_enabled" => {
            config.sync_enabled = value
                .parse()
                .context("Invalid value for sync_enabled. Use 'true' or 'false'.")?;
        }
        "pull_batch_size" => {
            let size: u32 = value
                .parse()
                .context("Invalid value for pull_batch_size. Use a positive number.")?;
            if size == 0 {
                bail!("pull_batch_size must be at least 1");
            }
            config.pull_batch_size = size;
        }
        "request_timeout_secs" => {
            config.request_timeout_secs = value
                .parse()
                .context("Invalid value for request_timeout_secs. Use a number of seconds.")?;
        }
        "protocol_version" => {
            config.protocol_version = match value.to_lowercase().as_str() {
                "v1" | "1" => ProtocolVersion::V1,
                "v2" | "2" => ProtocolVersion::V2,
                _ => bail!("Invalid value for protocol_version. Use 'v1' or 'v2'."),
            };
        }
        "log_file" => {
            config.log_file = optional(value).map(Into::into);
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                VALID_KEYS
            );
        }
    }
    Ok(())
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

fn protocol_name(version: ProtocolVersion) -> &'static str {
    match version {
        ProtocolVersion::V1 => "v1",
        ProtocolVersion::V2 => "v2",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_known_keys() {
        let mut config = Config::default();

        apply(&mut config, "server_url", "https://sync.example.com/api/v1").unwrap();
        apply(&mut config, "sync_enabled", "true").unwrap();
        apply(&mut config, "pull_batch_size", "50").unwrap();
        apply(&mut config, "protocol_version", "v1").unwrap();

        assert_eq!(
            config.server_url.as_deref(),
            Some("https://sync.example.com/api/v1")
        );
        assert!(config.sync_enabled);
        assert_eq!(config.pull_batch_size, 50);
        assert_eq!(config.protocol_version, ProtocolVersion::V1);
    }

    #[test]
    fn test_apply_clears_optional_values() {
        let mut config = Config::default();
        config.app_id = Some("folio".to_string());

        apply(&mut config, "app_id", "none").unwrap();
        assert!(config.app_id.is_none());
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let mut config = Config::default();

        assert!(apply(&mut config, "sync_enabled", "maybe").is_err());
        assert!(apply(&mut config, "pull_batch_size", "0").is_err());
        assert!(apply(&mut config, "protocol_version", "v3").is_err());

        let err = apply(&mut config, "favorite_tag", "x").unwrap_err();
        assert!(err.to_string().contains("Unknown configuration key"));
    }

    #[test]
    fn test_set_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let output = Output::new(OutputFormat::Quiet);

        std::fs::write(
            &path,
            format!("data_dir = {:?}\n", dir.path().join("data").display().to_string()),
        )
        .unwrap();

        set("app_id".into(), "folio".into(), Some(&path), &output).unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.app_id.as_deref(), Some("folio"));
    }
}
