//! CLI tests that need no database server.

#![allow(deprecated)] // Command::cargo_bin is deprecated but replacement requires newer assert_cmd

use std::fs;
use std::net::TcpListener;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn crashwatch() -> Command {
    let mut cmd = Command::cargo_bin("crashwatch").unwrap();
    cmd.env("NO_COLOR", "1");
    cmd
}

/// A config file in a fresh directory, so no project or user config leaks in.
fn config_file(temp: &TempDir, body: &str) -> PathBuf {
    let path = temp.path().join("crashwatch.toml");
    fs::write(&path, body).unwrap();
    path
}

// ============================================================================
// Help and Listing
// ============================================================================

#[test]
fn help_flag_shows_usage() {
    crashwatch()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("crash-recovery"));
}

#[test]
fn version_flag_shows_version() {
    crashwatch()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("crashwatch"));
}

#[test]
fn list_shows_every_scenario() {
    crashwatch()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("single-thread"))
        .stdout(predicate::str::contains("with-checkpoint"))
        .stdout(predicate::str::contains("write-write-conflict"))
        .stdout(predicate::str::contains("isolation"));
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn config_prints_file_values() {
    let temp = TempDir::new().unwrap();
    let path = config_file(&temp, "[scenarios]\nscale = 0.5\n");

    crashwatch()
        .current_dir(temp.path())
        .args(["--config", path.to_str().unwrap(), "config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("scale = 0.5"))
        .stdout(predicate::str::contains("[server]"));
}

#[test]
fn smoke_flag_overrides_scale() {
    let temp = TempDir::new().unwrap();
    let path = config_file(&temp, "[scenarios]\nscale = 0.5\n");

    crashwatch()
        .current_dir(temp.path())
        .args(["--smoke", "--config", path.to_str().unwrap(), "config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("scale = 0.05"));
}

#[test]
fn malformed_config_is_rejected() {
    let temp = TempDir::new().unwrap();
    let path = config_file(&temp, "[scenarios\nscale = ");

    crashwatch()
        .current_dir(temp.path())
        .args(["--config", path.to_str().unwrap(), "config"])
        .assert()
        .failure();
}

#[test]
fn invalid_config_values_are_rejected() {
    let temp = TempDir::new().unwrap();
    let path = config_file(&temp, "[workload]\nfault_start_fraction = 1.5\n");

    crashwatch()
        .current_dir(temp.path())
        .args(["--config", path.to_str().unwrap(), "config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("fault_start_fraction"));
}

// ============================================================================
// Argument Validation
// ============================================================================

#[test]
fn run_rejects_unknown_scenario() {
    let temp = TempDir::new().unwrap();
    let path = config_file(&temp, "");

    crashwatch()
        .current_dir(temp.path())
        .args(["--config", path.to_str().unwrap(), "run", "--scenario", "bogus"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown scenario"));
}

#[test]
fn run_rejects_non_positive_scale() {
    let temp = TempDir::new().unwrap();
    let path = config_file(&temp, "");

    crashwatch()
        .current_dir(temp.path())
        .args(["--config", path.to_str().unwrap(), "run", "--scale", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid --scale"));
}

#[test]
fn script_requires_existing_file() {
    let temp = TempDir::new().unwrap();
    let path = config_file(&temp, "");

    crashwatch()
        .current_dir(temp.path())
        .args(["--config", path.to_str().unwrap(), "script", "missing.sql"])
        .assert()
        .failure();
}

#[test]
fn script_requires_path_argument() {
    crashwatch()
        .arg("script")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

// ============================================================================
// Probe
// ============================================================================

#[test]
fn probe_fails_without_server() {
    let temp = TempDir::new().unwrap();
    let path = config_file(&temp, "");
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let address = format!("127.0.0.1:{port}");

    crashwatch()
        .current_dir(temp.path())
        .args(["--config", path.to_str().unwrap(), "probe", "--address", &address])
        .assert()
        .failure()
        .stderr(predicate::str::contains(address.as_str()));
}

#[test]
fn probe_rejects_unparseable_address() {
    let temp = TempDir::new().unwrap();
    let path = config_file(&temp, "");

    crashwatch()
        .current_dir(temp.path())
        .args(["--config", path.to_str().unwrap(), "probe", "--address", "not-an-address"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid address"));
}
