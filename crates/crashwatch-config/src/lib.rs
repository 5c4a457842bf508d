//! Configuration management for crashwatch
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. CLI arguments (highest precedence, applied by the caller)
//! 2. Environment variables (CRASHWATCH_* prefix, `__` between section and key)
//! 3. crashwatch.local.toml (gitignored, local overrides)
//! 4. crashwatch.toml (git-tracked, project config)
//! 5. ~/.config/crashwatch/config.toml (user defaults)
//! 6. Built-in defaults (lowest precedence)
//!
//! Durations are stored as integer `_ms`/`_secs` fields so they read
//! naturally in TOML and environment variables; each section exposes
//! `Duration` accessors.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::{Paths, STATE_DIR};

/// Main crashwatch configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashwatchConfig {
    pub server: ServerConfig,
    pub wire: WireConfig,
    pub recovery: RecoveryConfig,
    pub workload: WorkloadConfig,
    pub interleave: InterleaveConfig,
    pub scenarios: ScenarioConfig,
}

/// How the database under test is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server executable. Invoked as `binary <instance> [args...]`.
    pub binary: PathBuf,
    /// Extra arguments; `{port}`, `{host}` and `{instance}` are substituted.
    pub args: Vec<String>,
    /// Extra environment variables for the server process.
    pub env: BTreeMap<String, String>,
    /// Instance names are `<prefix>_<scenario>`.
    pub instance_prefix: String,
    /// Parent of every per-scenario working directory.
    pub workdir: PathBuf,
    pub host: String,
    pub port: u16,
    pub startup_timeout_secs: u64,
    pub startup_poll_ms: u64,
    pub graceful_timeout_secs: u64,
    /// Statement sent before SIGTERM on graceful stop, if the server has one.
    pub shutdown_statement: Option<String>,
    /// How long to wait for the port to become free before a start fails.
    pub port_release_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("bin/server"),
            args: Vec::new(),
            env: BTreeMap::new(),
            instance_prefix: "crash_test_db".to_string(),
            workdir: Path::new(STATE_DIR).join("work"),
            host: "127.0.0.1".to_string(),
            port: 8765,
            startup_timeout_secs: 30,
            startup_poll_ms: 100,
            graceful_timeout_secs: 5,
            shutdown_statement: None,
            port_release_timeout_ms: 2000,
        }
    }
}

impl ServerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn startup_poll(&self) -> Duration {
        Duration::from_millis(self.startup_poll_ms)
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs)
    }

    pub fn port_release_timeout(&self) -> Duration {
        Duration::from_millis(self.port_release_timeout_ms)
    }
}

/// Response framing selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FramingMode {
    Idle,
    Terminator,
    SingleRead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    pub buffer_size: usize,
    pub framing: FramingMode,
    /// Quiet gap that ends a response in idle framing.
    pub idle_ms: u64,
    /// Terminator byte for terminator framing.
    pub terminator: u8,
    pub max_response_bytes: usize,
    pub connect_timeout_ms: u64,
    /// Timeout for one-shot statements (setup, verification).
    pub statement_timeout_secs: u64,
    /// Timeout for statements on held workload sessions.
    pub session_timeout_secs: u64,
    /// Timeout for liveness probes.
    pub probe_timeout_ms: u64,
    /// Write a JSON lines interaction log per scenario.
    pub interaction_log: bool,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            framing: FramingMode::Idle,
            idle_ms: 10,
            terminator: 0,
            max_response_bytes: 16 * 1024 * 1024,
            connect_timeout_ms: 5000,
            statement_timeout_secs: 30,
            session_timeout_secs: 60,
            probe_timeout_ms: 1000,
            interaction_log: true,
        }
    }
}

impl WireConfig {
    pub fn idle_gap(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Outer bound on one recovery episode.
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Bound on waiting for a faulted server to stop accepting connections.
    pub death_timeout_secs: u64,
    pub probe_statement: String,
    /// Best-effort phase query; `None` disables phase tracking.
    pub phase_statement: Option<String>,
    /// Best-effort I/O counters query; `None` disables collection.
    pub io_stats_statement: Option<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 180,
            poll_interval_ms: 100,
            death_timeout_secs: 5,
            probe_statement: "SELECT 1;".to_string(),
            phase_statement: Some("SHOW RECOVERY PHASE;".to_string()),
            io_stats_statement: Some("SHOW IO STATISTICS;".to_string()),
        }
    }
}

impl RecoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn death_timeout(&self) -> Duration {
        Duration::from_secs(self.death_timeout_secs)
    }
}

/// How a fault is delivered to the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FaultModeKind {
    /// SIGKILL to the server's process group.
    Kill,
    /// The server's own crash statement, then confirmed death.
    CrashCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub seed: u64,
    /// Statements slower than this are flagged in the report.
    pub slow_threshold_ms: u64,
    /// Progress fraction after which faults may fire.
    pub fault_start_fraction: f64,
    /// Fault probability reached at the last statement.
    pub fault_ceiling: f64,
    /// Inject at the last statement if the ramp never fired.
    pub force_fault_by_end: bool,
    pub fault_mode: FaultModeKind,
    pub checkpoint_statement: String,
    pub crash_statement: String,
    /// Bound on confirming the server died after the crash statement.
    pub crash_confirm_ms: u64,
    /// Fraction of workload statements allowed to return SQL errors.
    pub sql_error_tolerance: f64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            slow_threshold_ms: 1000,
            fault_start_fraction: 0.5,
            fault_ceiling: 0.05,
            force_fault_by_end: true,
            fault_mode: FaultModeKind::CrashCommand,
            checkpoint_statement: "CREATE STATIC_CHECKPOINT;".to_string(),
            crash_statement: "crash".to_string(),
            crash_confirm_ms: 5000,
            sql_error_tolerance: 0.1,
        }
    }
}

impl WorkloadConfig {
    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_threshold_ms)
    }

    pub fn crash_confirm(&self) -> Duration {
        Duration::from_millis(self.crash_confirm_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterleaveConfig {
    /// A session blocked on a barrier longer than this is a suspected deadlock.
    pub barrier_timeout_secs: u64,
}

impl Default for InterleaveConfig {
    fn default() -> Self {
        Self {
            barrier_timeout_secs: 10,
        }
    }
}

impl InterleaveConfig {
    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_secs(self.barrier_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Report, server output and interaction logs land here.
    pub artifacts_dir: PathBuf,
    /// Scenario names to run; empty runs all.
    pub enabled: Vec<String>,
    /// Multiplier for row and transaction counts.
    pub scale: f64,
    /// Statements per explicit transaction in multi-thread scenarios.
    pub batch_size: usize,
    /// Checkpoint every N statements in the checkpoint scenario.
    pub checkpoint_interval: usize,
    /// Required `t2 / t1` bound for checkpoint-assisted recovery.
    pub checkpoint_ratio: f64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            artifacts_dir: Path::new(STATE_DIR).join("artifacts"),
            enabled: Vec::new(),
            scale: 1.0,
            batch_size: 5,
            checkpoint_interval: 50,
            checkpoint_ratio: 0.7,
        }
    }
}

impl ScenarioConfig {
    /// Applies `scale` to a count, keeping at least one.
    pub fn scaled(&self, count: usize) -> usize {
        ((count as f64 * self.scale).round() as usize).max(1)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.is_empty() || self.enabled.iter().any(|n| n == name)
    }
}

impl CrashwatchConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Read a single TOML file on top of the built-in defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// A fast configuration for smoke runs: small data, short timeouts.
    pub fn smoke() -> Self {
        let mut config = Self::default();
        config.apply_smoke();
        config
    }

    /// Shrinks data volume and timeouts in place, keeping everything else.
    pub fn apply_smoke(&mut self) {
        self.server.startup_timeout_secs = 10;
        self.server.graceful_timeout_secs = 2;
        self.recovery.timeout_secs = 30;
        self.scenarios.scale = 0.05;
        self.scenarios.checkpoint_interval = 5;
    }

    /// Resolve relative paths to absolute
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();

        if self.server.binary.is_relative() && self.server.binary.components().count() > 1 {
            self.server.binary = base.join(&self.server.binary);
        }

        if self.server.workdir.is_relative() {
            self.server.workdir = base.join(&self.server.workdir);
        }

        if self.scenarios.artifacts_dir.is_relative() {
            self.scenarios.artifacts_dir = base.join(&self.scenarios.artifacts_dir);
        }
    }

    /// Rejects values the harness cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.server.port == 0 {
            return invalid("server.port must be non-zero");
        }
        if self.server.startup_timeout_secs == 0 || self.server.startup_poll_ms == 0 {
            return invalid("server startup timeout and poll interval must be non-zero");
        }
        if self.wire.buffer_size == 0 || self.wire.max_response_bytes < self.wire.buffer_size {
            return invalid("wire.buffer_size must be non-zero and at most wire.max_response_bytes");
        }
        if self.wire.statement_timeout_secs == 0
            || self.wire.session_timeout_secs == 0
            || self.wire.probe_timeout_ms == 0
        {
            return invalid("wire timeouts must be non-zero");
        }
        if self.recovery.timeout_secs == 0 || self.recovery.poll_interval_ms == 0 {
            return invalid("recovery timeout and poll interval must be non-zero");
        }
        if !(0.0..1.0).contains(&self.workload.fault_start_fraction) {
            return invalid("workload.fault_start_fraction must be in [0, 1)");
        }
        if !(0.0..=1.0).contains(&self.workload.fault_ceiling) {
            return invalid("workload.fault_ceiling must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.workload.sql_error_tolerance) {
            return invalid("workload.sql_error_tolerance must be in [0, 1]");
        }
        if self.interleave.barrier_timeout_secs == 0 {
            return invalid("interleave.barrier_timeout_secs must be non-zero");
        }
        if self.scenarios.checkpoint_interval == 0 || self.scenarios.batch_size == 0 {
            return invalid("scenarios.checkpoint_interval and batch_size must be non-zero");
        }
        let ratio = self.scenarios.checkpoint_ratio;
        if ratio.is_nan() || ratio <= 0.0 || ratio > 1.0 {
            return invalid("scenarios.checkpoint_ratio must be in (0, 1]");
        }
        if self.scenarios.scale.is_nan() || self.scenarios.scale <= 0.0 {
            return invalid("scenarios.scale must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CrashwatchConfig::default();
        assert_eq!(config.server.port, 8765);
        assert_eq!(config.wire.buffer_size, 8192);
        assert_eq!(config.recovery.timeout(), Duration::from_secs(180));
        assert_eq!(config.recovery.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.workload.fault_mode, FaultModeKind::CrashCommand);
        assert!((config.scenarios.checkpoint_ratio - 0.7).abs() < f64::EPSILON);
        config.validate().unwrap();
    }

    #[test]
    fn test_smoke_config() {
        let config = CrashwatchConfig::smoke();
        assert!(config.scenarios.scale < 1.0);
        assert_eq!(config.scenarios.scaled(50), 3);
        assert_eq!(config.scenarios.scaled(1), 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_apply_smoke_keeps_other_settings() {
        let mut config = CrashwatchConfig::default();
        config.server.port = 9100;
        config.scenarios.enabled = vec!["indexed".to_string()];
        config.apply_smoke();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.scenarios.enabled, vec!["indexed".to_string()]);
        assert_eq!(config.recovery.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = CrashwatchConfig::default();
        config.workload.fault_ceiling = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(_))
        ));

        let mut config = CrashwatchConfig::default();
        config.scenarios.checkpoint_ratio = 0.0;
        assert!(config.validate().is_err());

        let mut config = CrashwatchConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enabled_filter() {
        let mut config = ScenarioConfig::default();
        assert!(config.is_enabled("single-thread"));
        config.enabled = vec!["indexed".to_string()];
        assert!(config.is_enabled("indexed"));
        assert!(!config.is_enabled("single-thread"));
    }

    #[test]
    fn test_path_resolution() {
        let mut config = CrashwatchConfig::default();
        config.resolve_paths("/home/user/project");

        assert_eq!(
            config.server.workdir,
            PathBuf::from("/home/user/project/.crashwatch/work")
        );
        assert_eq!(
            config.server.binary,
            PathBuf::from("/home/user/project/bin/server")
        );
        assert_eq!(
            config.scenarios.artifacts_dir,
            PathBuf::from("/home/user/project/.crashwatch/artifacts")
        );
    }

    #[test]
    fn test_bare_binary_name_is_left_for_path_lookup() {
        let mut config = CrashwatchConfig::default();
        config.server.binary = PathBuf::from("dbserver");
        config.resolve_paths("/home/user/project");
        assert_eq!(config.server.binary, PathBuf::from("dbserver"));
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, "[server]\nport = 9001\n\n[wire]\nframing = \"single-read\"\n")
            .unwrap();

        let config = CrashwatchConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.wire.framing, FramingMode::SingleRead);
        assert_eq!(config.wire.buffer_size, 8192);

        let missing = CrashwatchConfig::from_toml_file(dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_server_env_table() {
        let config: CrashwatchConfig =
            toml::from_str("[server.env]\nSTUBDB_REDO_DELAY_US = \"500\"\n").unwrap();
        assert_eq!(
            config.server.env.get("STUBDB_REDO_DELAY_US").map(String::as_str),
            Some("500")
        );
    }
}
