//! Runtime settings derived from [`CrashwatchConfig`].

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use crashwatch_config::{CrashwatchConfig, FaultModeKind, FramingMode, WireConfig};
use crashwatch_wire::{ClientConfig, ResponseFraming};

use crate::fault::FaultMode;
use crate::recovery::MonitorSettings;
use crate::supervisor::{LaunchSpec, SupervisorConfig};
use crate::workload::{CheckpointTrigger, DriverOptions, FaultPlan};

pub fn client_config(wire: &WireConfig) -> ClientConfig {
    let framing = match wire.framing {
        FramingMode::Idle => ResponseFraming::Idle(wire.idle_gap()),
        FramingMode::Terminator => ResponseFraming::Terminator(wire.terminator),
        FramingMode::SingleRead => ResponseFraming::SingleRead,
    };
    ClientConfig {
        connect_timeout: wire.connect_timeout(),
        buffer_size: wire.buffer_size,
        max_response_bytes: wire.max_response_bytes,
        framing,
    }
}

/// Resolves `server.host:server.port`, preferring IPv4.
pub fn server_addr(config: &CrashwatchConfig) -> io::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (config.server.host.as_str(), config.server.port)
        .to_socket_addrs()?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} did not resolve", config.server.host),
            )
        })
}

/// Launch spec for the configured server as `instance`, working in
/// `server.workdir/<instance>` and logging to `log_dir`.
pub fn launch_spec(
    config: &CrashwatchConfig,
    instance: &str,
    addr: SocketAddr,
    log_dir: impl Into<PathBuf>,
) -> LaunchSpec {
    let server = &config.server;
    let mut spec = LaunchSpec::new(&server.binary, instance, server.workdir.join(instance), addr)
        .with_args(server.args.iter().cloned())
        .with_log_dir(log_dir);
    for (key, value) in &server.env {
        spec = spec.with_env(key, value);
    }
    spec
}

pub fn supervisor_config(config: &CrashwatchConfig) -> SupervisorConfig {
    SupervisorConfig {
        probe_statement: config.recovery.probe_statement.clone(),
        probe_timeout: config.wire.probe_timeout(),
        poll_interval: config.server.startup_poll(),
        startup_timeout: config.server.startup_timeout(),
        graceful_timeout: config.server.graceful_timeout(),
        port_release_timeout: config.server.port_release_timeout(),
        reap_timeout: config.recovery.death_timeout(),
        shutdown_statement: config.server.shutdown_statement.clone(),
        client: client_config(&config.wire),
    }
}

pub fn monitor_settings(config: &CrashwatchConfig) -> MonitorSettings {
    MonitorSettings {
        probe_statement: config.recovery.probe_statement.clone(),
        probe_timeout: config.wire.probe_timeout(),
        poll_interval: config.recovery.poll_interval(),
        timeout: config.recovery.timeout(),
        death_timeout: config.recovery.death_timeout(),
        phase_statement: config.recovery.phase_statement.clone(),
        io_stats_statement: config.recovery.io_stats_statement.clone(),
        client: client_config(&config.wire),
    }
}

pub fn fault_mode(config: &CrashwatchConfig) -> FaultMode {
    match config.workload.fault_mode {
        FaultModeKind::Kill => FaultMode::Kill,
        FaultModeKind::CrashCommand => FaultMode::CrashCommand {
            statement: config.workload.crash_statement.clone(),
            confirm_within: config.workload.crash_confirm(),
        },
    }
}

/// Driver options with the configured fault ramp and, when
/// `checkpoint_every` is set, a statement-count checkpoint trigger.
pub fn driver_options(config: &CrashwatchConfig, checkpoint_every: Option<usize>) -> DriverOptions {
    DriverOptions {
        checkpoint: checkpoint_every.map(CheckpointTrigger::EveryStatements),
        checkpoint_statement: config.workload.checkpoint_statement.clone(),
        slow_threshold: config.workload.slow_threshold(),
        fault: Some(FaultPlan {
            start_fraction: config.workload.fault_start_fraction,
            ceiling: config.workload.fault_ceiling,
            force_by_end: config.workload.force_fault_by_end,
            seed: config.workload.seed,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_client_config_from_wire() {
        let mut wire = WireConfig::default();
        assert_eq!(
            client_config(&wire).framing,
            ResponseFraming::Idle(Duration::from_millis(10))
        );
        wire.framing = FramingMode::Terminator;
        wire.terminator = b'\n';
        assert_eq!(client_config(&wire).framing, ResponseFraming::Terminator(b'\n'));
    }

    #[test]
    fn test_server_addr_default() {
        let addr = server_addr(&CrashwatchConfig::default()).unwrap();
        assert_eq!(addr, "127.0.0.1:8765".parse().unwrap());
    }

    #[test]
    fn test_launch_spec_carries_args_and_env() {
        let mut config = CrashwatchConfig::default();
        config.server.args = vec!["--port".into(), "{port}".into()];
        config.server.env.insert("DB_MODE".into(), "test".into());
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();

        let spec = launch_spec(&config, "cw_probe", addr, "/tmp/logs");
        assert_eq!(spec.workdir, config.server.workdir.join("cw_probe"));
        assert_eq!(spec.command_args(), vec!["cw_probe", "--port", "9001"]);
        assert_eq!(spec.env, vec![("DB_MODE".to_string(), "test".to_string())]);
        assert_eq!(spec.log_dir, PathBuf::from("/tmp/logs"));
    }

    #[test]
    fn test_checkpoint_trigger() {
        let config = CrashwatchConfig::default();
        assert_eq!(driver_options(&config, None).checkpoint, None);
        assert_eq!(
            driver_options(&config, Some(50)).checkpoint,
            Some(CheckpointTrigger::EveryStatements(50))
        );
    }
}
