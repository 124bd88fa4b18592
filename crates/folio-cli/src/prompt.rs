//! Interactive prompts

use anyhow::{bail, Result};
use std::io::{self, Write};

/// Prompt for confirmation
///
/// Returns true if user confirms, false otherwise.
/// In non-interactive mode (no TTY), returns false.
pub fn confirm(prompt: &str) -> Result<bool> {
    if !atty::is(atty::Stream::Stdin) {
        return Ok(false);
    }

    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    Ok(is_yes(&input))
}

/// Read a required value, prompting on a TTY
///
/// Piped stdin is read as-is so credentials can be scripted.
pub fn read_value(prompt: &str) -> Result<String> {
    if atty::is(atty::Stream::Stdin) {
        print!("{}: ", prompt);
        io::stdout().flush()?;
    }

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let value = input.trim_end_matches(['\r', '\n']).to_string();

    if value.is_empty() {
        bail!("{} is required", prompt);
    }
    Ok(value)
}

fn is_yes(input: &str) -> bool {
    let input = input.trim().to_lowercase();
    input == "y" || input == "yes"
}
