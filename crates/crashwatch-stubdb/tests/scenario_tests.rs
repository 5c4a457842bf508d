//! End-to-end scenarios against the fixture server at smoke scale.

mod support;

use crashwatch::{
    Baseline, CancelToken, Orchestrator, ScenarioKind, ScenarioReport, StatementScript,
};
use test_case::test_case;

fn assert_passed(report: &ScenarioReport) {
    assert!(
        report.passed,
        "{} failed: {:?}\nchecks: {:#?}",
        report.name,
        report.failure,
        report.consistency.failed().collect::<Vec<_>>()
    );
}

#[test_case(ScenarioKind::SingleThread ; "single thread")]
#[test_case(ScenarioKind::MultiThread ; "multi thread")]
#[test_case(ScenarioKind::Indexed ; "indexed")]
#[test_case(ScenarioKind::LargeData ; "large data")]
fn test_crash_scenario_recovers_consistently(kind: ScenarioKind) {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::new(support::stub_config(dir.path()));

    let report = orchestrator.run_scenario(kind, Baseline::NotRun);

    assert_passed(&report);
    assert!(report.fault.is_some());
    assert!(report.recovery.as_ref().is_some_and(|r| r.recovered()));
    assert!(!report.consistency.checks.is_empty());
}

#[test_case(ScenarioKind::SnapshotIsolation ; "snapshot isolation")]
#[test_case(ScenarioKind::ReadWriteConcurrency ; "read write concurrency")]
#[test_case(ScenarioKind::WriteWriteConflict ; "write write conflict")]
fn test_isolation_scenario_passes(kind: ScenarioKind) {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::new(support::stub_config(dir.path()));

    let report = orchestrator.run_scenario(kind, Baseline::NotRun);

    assert_passed(&report);
    assert!(report.fault.is_none());
    assert!(!report.transcripts.is_empty());
}

#[test]
fn test_checkpoints_shorten_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = support::stub_config(dir.path());
    config
        .server
        .env
        .insert("STUBDB_REDO_DELAY_US".into(), "2000".into());
    config.scenarios.enabled = vec!["no-checkpoint".into(), "with-checkpoint".into()];

    let suite = Orchestrator::new(config).run_suite();

    assert_eq!(suite.scenarios.len(), 2);
    for report in &suite.scenarios {
        assert_passed(report);
    }
    let (t1, t2) = (suite.t1.unwrap(), suite.t2.unwrap());
    assert!(t2 < t1, "t1 = {t1:?}, t2 = {t2:?}");
    let ratio = suite.scenarios[1]
        .consistency
        .checks
        .iter()
        .find(|c| c.name == "checkpoint_recovery_ratio")
        .unwrap();
    assert!(ratio.passed, "{}", ratio.observed);
    assert!(suite.scenarios[1].executions[0].checkpoints > 0);
    assert!(suite.passed);
}

fn ratio_check(report: &ScenarioReport) -> &crashwatch::CheckResult {
    report
        .consistency
        .checks
        .iter()
        .find(|c| c.name == "checkpoint_recovery_ratio")
        .unwrap()
}

#[test]
fn test_checkpoint_ratio_fails_when_baseline_never_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::new(support::stub_config(dir.path()));

    let report = orchestrator.run_scenario(ScenarioKind::WithCheckpoint, Baseline::Missing);

    assert!(report.recovery.as_ref().is_some_and(|r| r.recovered()));
    assert!(!report.passed);
    let ratio = ratio_check(&report);
    assert!(!ratio.passed);
    assert!(ratio.observed.contains("(t1)"), "{}", ratio.observed);
}

#[test]
fn test_checkpoint_ratio_skipped_without_baseline_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = support::stub_config(dir.path());
    config.scenarios.enabled = vec!["with-checkpoint".into()];

    let suite = Orchestrator::new(config).run_suite();

    assert_eq!(suite.scenarios.len(), 1);
    assert_passed(&suite.scenarios[0]);
    assert!(suite.t1.is_none());
    assert!(ratio_check(&suite.scenarios[0]).observed.starts_with("skipped"));
}

#[test]
fn test_script_with_crash_marker() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orders.sql");
    std::fs::write(
        &path,
        "-- orders survive a crash\n\
         CREATE TABLE orders (id INT,\n\
                              amount INT);\n\
         INSERT INTO orders VALUES (1, 10);\n\
         INSERT INTO orders VALUES (2, 20);\n\
         crash\n\
         INSERT INTO orders VALUES (3, 30);\n\
         SELECT COUNT(*) FROM orders;\n",
    )
    .unwrap();
    let script = StatementScript::from_file(&path).unwrap();
    assert_eq!(script.crash_point(), Some(3));

    let orchestrator = Orchestrator::new(support::stub_config(dir.path()));
    let report = orchestrator.run_script("orders.sql", &script);

    assert_passed(&report);
    assert_eq!(report.name, "script-orders_sql");
    assert_eq!(report.fault.as_ref().map(|f| f.statement_index), Some(3));
    assert!(report.recovery.as_ref().is_some_and(|r| r.recovered()));
    let read = &report.consistency.checks[0];
    assert_eq!(read.name, "read_0");
    assert!(read.observed.contains("| 2 |"), "{}", read.observed);
}

#[test]
fn test_script_without_crash_marker_only_verifies() {
    let dir = tempfile::tempdir().unwrap();
    let script = StatementScript::parse(
        "CREATE TABLE t (id INT);\nINSERT INTO t VALUES (1);\nSELECT * FROM t;\n",
    );

    let orchestrator = Orchestrator::new(support::stub_config(dir.path()));
    let report = orchestrator.run_script("plain", &script);

    assert_passed(&report);
    assert!(report.fault.is_none());
    assert!(report.recovery.is_none());
    assert_eq!(report.consistency.checks.len(), 1);
}

#[test]
fn test_interrupted_suite_skips_remaining_scenarios() {
    let dir = tempfile::tempdir().unwrap();
    let interrupt = CancelToken::new();
    interrupt.cancel();
    let orchestrator =
        Orchestrator::new(support::stub_config(dir.path())).with_interrupt(interrupt);

    let suite = orchestrator.run_suite();

    assert_eq!(suite.scenarios.len(), ScenarioKind::ALL.len());
    assert!(
        suite
            .scenarios
            .iter()
            .all(|r| r.skipped.as_deref() == Some("interrupted"))
    );
    assert!(suite.passed);
    assert_eq!(suite.failed().count(), 0);
}
