//! Fault delivery and recovery episodes against the fixture server.

mod support;

use std::time::Duration;

use crashwatch::{
    CancelToken, FaultInjector, FaultMode, MonitorSettings, RecoveryMonitor,
    RecoveryOutcome, ServerState, Supervisor, SupervisorConfig,
};
use crashwatch_wire::{ClientConfig, WireClient};

const TIMEOUT: Duration = Duration::from_secs(2);

fn supervisor() -> Supervisor {
    Supervisor::new(SupervisorConfig {
        startup_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(20),
        ..SupervisorConfig::default()
    })
}

fn monitor(timeout: Duration) -> RecoveryMonitor {
    RecoveryMonitor::new(MonitorSettings {
        poll_interval: Duration::from_millis(20),
        probe_timeout: Duration::from_millis(500),
        timeout,
        ..MonitorSettings::default()
    })
}

fn send(client: &mut WireClient, sql: &str) -> String {
    let response = client.send(sql, TIMEOUT).unwrap();
    assert!(response.is_ok(), "{sql} -> {}", response.text);
    response.text
}

fn seed_rows(client: &mut WireClient, rows: usize) {
    send(client, "CREATE TABLE t (id INT, v INT);");
    for i in 0..rows {
        send(client, &format!("INSERT INTO t VALUES ({i}, {});", i * 10));
    }
}

#[test]
fn test_kill_and_recover_replays_committed_rows() {
    let dir = tempfile::tempdir().unwrap();
    let spec =
        support::stub_spec(dir.path(), "rec_replay").with_env("STUBDB_REDO_DELAY_US", "3000");
    let mut supervisor = supervisor();
    let mut handle = supervisor.start(&spec).unwrap();

    let mut client = WireClient::new(spec.addr, ClientConfig::default());
    seed_rows(&mut client, 150);

    // An open transaction at the time of the fault must not survive.
    send(&mut client, "BEGIN;");
    send(&mut client, "INSERT INTO t VALUES (999, 0);");

    let cancel = CancelToken::new();
    let injector = FaultInjector::new(
        FaultMode::Kill,
        &handle,
        ClientConfig::default(),
        cancel.clone(),
    );
    let fault = injector.inject_now().unwrap();
    assert!(cancel.is_cancelled());
    drop(client);

    let record = monitor(Duration::from_secs(30))
        .await_recovery(&mut supervisor, &mut handle, &fault)
        .unwrap();
    assert_eq!(record.outcome, RecoveryOutcome::Recovered);
    assert!(record.recovered());
    assert_eq!(handle.state(), ServerState::Running);
    assert_eq!(handle.generation(), 1);
    assert!(record.probes >= 1);
    assert!(
        record.phases.iter().any(|p| p.phase == "redo"),
        "phases: {:?}",
        record.phases
    );
    assert!(record.io.as_ref().is_some_and(|io| io.total_io.is_some()));

    let mut client = WireClient::new(spec.addr, ClientConfig::default());
    let count = send(&mut client, "SELECT COUNT(*) FROM t;");
    assert!(count.contains("| 150 |"), "{count}");

    supervisor.stop(&mut handle, TIMEOUT).unwrap();
}

#[test]
fn test_crash_statement_fault() {
    let dir = tempfile::tempdir().unwrap();
    let spec = support::stub_spec(dir.path(), "rec_crash_cmd");
    let mut supervisor = supervisor();
    let mut handle = supervisor.start(&spec).unwrap();

    let injector = FaultInjector::new(
        FaultMode::CrashCommand {
            statement: "crash".into(),
            confirm_within: Duration::from_secs(5),
        },
        &handle,
        ClientConfig::default(),
        CancelToken::new(),
    );
    let fault = injector.inject_now().unwrap();
    assert!(!supervisor.probe(spec.addr));

    let record = monitor(Duration::from_secs(30))
        .await_recovery(&mut supervisor, &mut handle, &fault)
        .unwrap();
    assert!(record.recovered());
    supervisor.stop(&mut handle, TIMEOUT).unwrap();
}

#[test]
fn test_slow_recovery_times_out() {
    let dir = tempfile::tempdir().unwrap();
    // The first launch has nothing to replay; the relaunch replays 21 entries.
    let spec =
        support::stub_spec(dir.path(), "rec_slow").with_env("STUBDB_REDO_DELAY_US", "500000");
    let mut supervisor = supervisor();
    let mut handle = supervisor.start(&spec).unwrap();

    let mut client = WireClient::new(spec.addr, ClientConfig::default());
    seed_rows(&mut client, 20);
    drop(client);

    let injector = FaultInjector::new(
        FaultMode::Kill,
        &handle,
        ClientConfig::default(),
        CancelToken::new(),
    );
    let fault = injector.inject_now().unwrap();

    let record = monitor(Duration::from_secs(1))
        .await_recovery(&mut supervisor, &mut handle, &fault)
        .unwrap();
    assert_eq!(record.outcome, RecoveryOutcome::TimedOut);
    assert!(record.io.is_none());
    assert!(record.latency >= Duration::from_secs(1));
    assert_eq!(handle.state(), ServerState::Recovering);

    supervisor.kill(&mut handle).unwrap();
}
