//! Effective configuration.

use std::process::ExitCode;

use anyhow::{Context, Result};

use super::{GlobalOptions, load_config};

pub fn run(options: &GlobalOptions) -> Result<ExitCode> {
    let config = load_config(options)?;
    let toml = toml::to_string_pretty(&config).context("failed to render configuration")?;
    print!("{toml}");
    Ok(ExitCode::SUCCESS)
}
