//! Errors reading an explicit config file or validating a loaded one.
//!
//! Layered loading goes through `anyhow`; these are the failures callers
//! match on.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file passed with `--config` could not be read.
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value the harness cannot run with; the message names the key.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
