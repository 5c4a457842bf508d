//! Crash scenarios: load, run with the fault hook, recover, verify.

use std::time::Duration;

use crashwatch_config::{CrashwatchConfig, ScenarioConfig};
use tracing::{info, warn};

use super::{Baseline, ScenarioKind};
use super::suite::{ScenarioEnv, ServerSlot};
use crate::error::HarnessResult;
use crate::fault::{FaultEvent, FaultInjector};
use crate::recovery::RecoveryMonitor;
use crate::report::ScenarioReport;
use crate::settings::{client_config, driver_options, fault_mode, monitor_settings};
use crate::supervisor::{ServerHandle, Supervisor};
use crate::verify::{
    Check, CheckResult, Expectation, recovery_ratio_check, standard_checks,
};
use crate::workload::{
    DriverOptions, ExecutionReport, ExpectedState, SessionWork, StatementScript, StopReason,
    Table, TpccGenerator, WorkloadDriver, WorkloadGenerator,
};

/// Data volume and workload shape of a crash scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashProfile {
    /// Tables and the rows bulk-loaded into each.
    pub loads: Vec<(Table, usize)>,
    pub indexed: bool,
    pub sessions: usize,
    /// Write/read operations per session.
    pub operations: usize,
    /// Operations per explicit transaction; 1 means autocommit.
    pub batch: usize,
    /// Indexed point queries appended to the first session.
    pub point_queries: usize,
    /// Checkpoint after every N statements.
    pub checkpoint_every: Option<usize>,
}

impl CrashProfile {
    /// Profile for a crash scenario, `None` for isolation scenarios.
    ///
    /// Row and operation counts are scaled; session counts are not.
    pub fn for_kind(kind: ScenarioKind, scenarios: &ScenarioConfig) -> Option<Self> {
        let n = |count| scenarios.scaled(count);
        let batch = scenarios.batch_size.max(1);
        let large_load = vec![
            (Table::Warehouse, n(5000)),
            (Table::District, n(2000)),
            (Table::Customer, n(10000)),
        ];
        let profile = match kind {
            ScenarioKind::SingleThread => Self {
                loads: vec![(Table::Warehouse, n(50))],
                indexed: false,
                sessions: 1,
                operations: n(20),
                batch: 1,
                point_queries: 0,
                checkpoint_every: None,
            },
            ScenarioKind::MultiThread => Self {
                loads: vec![(Table::Warehouse, n(200)), (Table::District, n(100))],
                indexed: false,
                sessions: 4,
                operations: n(50),
                batch,
                point_queries: 0,
                checkpoint_every: None,
            },
            ScenarioKind::Indexed => Self {
                loads: vec![(Table::Warehouse, n(1000)), (Table::District, n(500))],
                indexed: true,
                sessions: 1,
                operations: 0,
                batch: 1,
                point_queries: n(200),
                checkpoint_every: None,
            },
            ScenarioKind::LargeData => Self {
                loads: vec![
                    (Table::Warehouse, n(2000)),
                    (Table::District, n(1000)),
                    (Table::Customer, n(5000)),
                ],
                indexed: false,
                sessions: 5,
                operations: n(50),
                batch,
                point_queries: 0,
                checkpoint_every: None,
            },
            ScenarioKind::NoCheckpoint => Self {
                loads: large_load,
                indexed: false,
                sessions: 1,
                operations: n(200),
                batch,
                point_queries: 0,
                checkpoint_every: None,
            },
            ScenarioKind::WithCheckpoint => Self {
                loads: large_load,
                indexed: false,
                sessions: 1,
                operations: n(200),
                batch,
                point_queries: 0,
                checkpoint_every: Some(scenarios.checkpoint_interval.max(1)),
            },
            ScenarioKind::SnapshotIsolation
            | ScenarioKind::ReadWriteConcurrency
            | ScenarioKind::WriteWriteConflict => return None,
        };
        Some(profile)
    }

    pub fn tables(&self) -> Vec<Table> {
        self.loads.iter().map(|(table, _)| *table).collect()
    }
}

/// Runs a crash scenario into `report`.
pub(crate) fn run(
    config: &CrashwatchConfig,
    kind: ScenarioKind,
    baseline: Baseline,
    env: &ScenarioEnv,
    supervisor: &mut Supervisor,
    slot: &mut ServerSlot,
    report: &mut ScenarioReport,
) -> HarnessResult<()> {
    let Some(profile) = CrashProfile::for_kind(kind, &config.scenarios) else {
        report.fail(format!("{kind} is not a crash scenario"));
        return Ok(());
    };
    let handle = slot.insert(supervisor.start(&env.spec)?);
    let factory = env.factory(config);
    let driver = WorkloadDriver::new(driver_options(config, profile.checkpoint_every));

    let tables = profile.tables();
    let mut generator = TpccGenerator::new(config.workload.seed);
    let mut expected = ExpectedState::new();
    let mut setup = generator.schema(&tables);
    for &(table, rows) in &profile.loads {
        setup.extend(generator.bulk_load(table, rows as u64));
        expected.add_base(table.name(), rows as u64);
    }
    if profile.indexed {
        setup.extend(generator.indexes(&tables));
    }
    let mut session = factory.open("setup");
    let loaded = driver.setup(&mut session, &setup)?;
    session.close();
    info!(statements = loaded, "schema and data loaded");

    let work: Vec<SessionWork> = (0..profile.sessions)
        .map(|s| {
            let mut statements = generator.transactions(s, profile.operations, profile.batch);
            if s == 0 {
                statements.extend(generator.point_queries(profile.point_queries));
            }
            SessionWork {
                label: format!("driver-{s}"),
                statements,
            }
        })
        .collect();

    let injector = FaultInjector::new(
        fault_mode(config),
        handle,
        client_config(&config.wire),
        env.cancel.clone(),
    );
    let mut executions = driver.run_concurrent(&factory, work, Some(&injector));
    for execution in &mut executions {
        expected.absorb(std::mem::take(&mut execution.ledger));
    }
    check_executions(config, &executions, report);
    let fault = executions.first().and_then(|e| e.fault.clone());
    let fault_error = executions.first().and_then(|e| e.fault_error.clone());
    report.executions = executions;

    let Some(fault) = fault else {
        report.fail(match fault_error {
            Some(e) => format!("fault injection failed: {e}"),
            None => "the workload ended without a fault".to_string(),
        });
        return Ok(());
    };
    report.fault = Some(fault.clone());

    let ratio = config.scenarios.checkpoint_ratio;
    let Some(latency) = recover(config, supervisor, handle, &fault, report)? else {
        if kind == ScenarioKind::WithCheckpoint {
            report.consistency.push(checkpoint_ratio_check(baseline, None, ratio));
        }
        return Ok(());
    };

    let mut consistency = env
        .verifier(config)
        .verify(&standard_checks(&tables, &expected, profile.indexed));
    if kind == ScenarioKind::WithCheckpoint {
        consistency.push(checkpoint_ratio_check(baseline, Some(latency), ratio));
    }
    report.consistency = consistency;
    Ok(())
}

/// Runs a statement script; crash markers are the only fault points.
///
/// After recovery the script's reads are rerun and must succeed.
pub(crate) fn run_script(
    config: &CrashwatchConfig,
    script: &StatementScript,
    env: &ScenarioEnv,
    supervisor: &mut Supervisor,
    slot: &mut ServerSlot,
    report: &mut ScenarioReport,
) -> HarnessResult<()> {
    let handle = slot.insert(supervisor.start(&env.spec)?);
    let factory = env.factory(config);
    let driver = WorkloadDriver::new(DriverOptions {
        fault: None,
        ..driver_options(config, None)
    });
    let injector = FaultInjector::new(
        fault_mode(config),
        handle,
        client_config(&config.wire),
        env.cancel.clone(),
    );

    let mut session = factory.open("script");
    let execution = driver.run(&mut session, script.statements(), Some(&injector));
    session.close();
    check_executions(config, std::slice::from_ref(&execution), report);
    let fault = execution.fault.clone();
    let fault_error = execution.fault_error.clone();
    report.executions.push(execution);

    match fault {
        Some(fault) => {
            report.fault = Some(fault.clone());
            if recover(config, supervisor, handle, &fault, report)?.is_none() {
                return Ok(());
            }
        }
        None if script.crash_point().is_some() => {
            report.fail(match fault_error {
                Some(e) => format!("fault injection failed: {e}"),
                None => "the crash marker was never reached".to_string(),
            });
            return Ok(());
        }
        None => {}
    }

    let checks: Vec<Check> = script
        .verification_queries()
        .into_iter()
        .enumerate()
        .map(|(i, statement)| Check::new(format!("read_{i}"), &statement.sql, Expectation::Succeeds))
        .collect();
    report.consistency = env.verifier(config).verify(&checks);
    Ok(())
}

/// Awaits recovery, recording it. Returns the latency when the server came
/// back within the deadline.
fn recover(
    config: &CrashwatchConfig,
    supervisor: &mut Supervisor,
    handle: &mut ServerHandle,
    fault: &FaultEvent,
    report: &mut ScenarioReport,
) -> HarnessResult<Option<Duration>> {
    let monitor = RecoveryMonitor::new(monitor_settings(config));
    let record = monitor.await_recovery(supervisor, handle, fault)?;
    let recovered = record.recovered().then_some(record.latency);
    info!(
        recovered = recovered.is_some(),
        latency_ms = record.latency.as_millis() as u64,
        probes = record.probes,
        "recovery finished"
    );
    report.recovery = Some(record);
    if recovered.is_none() {
        report.fail(format!(
            "server did not recover within {:?}",
            config.recovery.timeout()
        ));
    }
    Ok(recovered)
}

/// Ratio check for the with-checkpoint scenario. Skipped only when the
/// no-checkpoint scenario was not run; a missing latency on either side fails.
fn checkpoint_ratio_check(baseline: Baseline, t2: Option<Duration>, ratio: f64) -> CheckResult {
    let verdict = |observed: &str, passed| {
        CheckResult::assertion(
            "checkpoint_recovery_ratio",
            format!("t2/t1 <= {ratio:.2}"),
            observed,
            passed,
        )
    };
    match (baseline, t2) {
        (Baseline::NotRun, _) => verdict("skipped: no-checkpoint scenario not run", true),
        (Baseline::Missing, _) => {
            verdict("no-checkpoint scenario recorded no recovery latency (t1)", false)
        }
        (Baseline::Recorded(_), None) => verdict("no recovery latency recorded (t2)", false),
        (Baseline::Recorded(t1), Some(t2)) => recovery_ratio_check(t1, t2, ratio),
    }
}

/// Fails the report for panicked drivers, connections lost before the
/// fault and SQL error rates above tolerance.
fn check_executions(
    config: &CrashwatchConfig,
    executions: &[ExecutionReport],
    report: &mut ScenarioReport,
) {
    let tolerance = config.workload.sql_error_tolerance;
    for execution in executions {
        match execution.stop {
            StopReason::Panicked => {
                report.fail(format!("driver `{}` panicked", execution.session));
            }
            StopReason::ConnectionLost => {
                report.fail(format!(
                    "driver `{}` lost its connection before the fault: {}",
                    execution.session,
                    execution.transport_error.as_deref().unwrap_or("unknown error")
                ));
            }
            StopReason::Completed | StopReason::Faulted | StopReason::Cancelled => {}
        }
        let rate = execution.sql_error_rate();
        if rate > tolerance {
            warn!(session = %execution.session, rate, tolerance, "sql error rate above tolerance");
            report.fail(format!(
                "driver `{}` sql error rate {rate:.3} exceeds {tolerance:.3}",
                execution.session
            ));
        }
    }
}
