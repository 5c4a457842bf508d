//! CLI command implementations.

pub mod config;
pub mod list;
pub mod probe;
pub mod run;
pub mod script;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use crashwatch::{CancelToken, SuiteReport};
use crashwatch_config::{ConfigLoader, CrashwatchConfig};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::info;

/// Flags shared by every subcommand.
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub smoke: bool,
}

/// Loads the configuration: an explicit file over the built-in defaults,
/// or the layered project configuration.
pub fn load_config(options: &GlobalOptions) -> Result<CrashwatchConfig> {
    let mut config = match &options.config {
        Some(path) => {
            let mut config = CrashwatchConfig::from_toml_file(path)?;
            let base = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
            config.resolve_paths(fs::canonicalize(&base).unwrap_or(base));
            config
        }
        None => ConfigLoader::new().load()?,
    };
    if options.smoke {
        config.apply_smoke();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// A token set by the first SIGINT or SIGTERM.
pub fn interrupt_token() -> Result<CancelToken> {
    let token = CancelToken::new();
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, token.flag())
            .with_context(|| format!("failed to install handler for signal {signal}"))?;
    }
    Ok(token)
}

/// Writes the suite report as pretty JSON, creating parent directories.
pub fn write_report(report: &SuiteReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(report).context("failed to serialize report")?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "report written");
    Ok(())
}

/// `explicit`, or `report.json` in the artifacts directory.
pub fn report_path(config: &CrashwatchConfig, explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| config.scenarios.artifacts_dir.join("report.json"))
}
