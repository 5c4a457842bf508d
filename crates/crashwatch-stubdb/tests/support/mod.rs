//! Launch helpers for the fixture server under test.

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};

use crashwatch::LaunchSpec;
use crashwatch_config::CrashwatchConfig;

/// The fixture server built alongside the tests.
pub fn stub_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_crashwatch-stubdb"))
}

/// A port nothing listens on right now.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("allocate a free port")
}

pub fn local(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Small, fast configuration driving the fixture server inside `dir`.
pub fn stub_config(dir: &Path) -> CrashwatchConfig {
    let mut config = CrashwatchConfig::smoke();
    config.server.binary = stub_binary();
    config.server.args = vec!["--port".into(), "{port}".into()];
    config.server.port = free_port();
    config.server.workdir = dir.join("work");
    config.scenarios.artifacts_dir = dir.join("artifacts");
    config.recovery.poll_interval_ms = 20;
    config.wire.probe_timeout_ms = 500;
    config
}

/// Launch spec for the fixture server with its own instance directory.
pub fn stub_spec(dir: &Path, instance: &str) -> LaunchSpec {
    let workdir = dir.join(instance);
    std::fs::create_dir_all(&workdir).expect("create workdir");
    LaunchSpec::new(stub_binary(), instance, workdir, local(free_port()))
        .with_args(["--port", "{port}"])
}
