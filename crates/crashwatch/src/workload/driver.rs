//! Workload driver.
//!
//! Executes a statement stream on one session, inserting checkpoint
//! requests at transaction boundaries and consulting an optional fault hook
//! before every send. The concurrent variant runs one driver per session on
//! scoped threads; only the first session may inject the fault, and the
//! others stop at their next statement once the shared token is cancelled.

use std::sync::Barrier;
use std::thread;
use std::time::{Duration, Instant};

use crashwatch_wire::ResponseStatus;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::ledger::SessionLedger;
use super::statement::{Statement, StatementKind};
use crate::error::{SessionError, WorkloadError};
use crate::fault::{FaultEvent, FaultHook, FaultProgress};
use crate::report::duration_ms;
use crate::session::{Session, SessionFactory, StatementRecord};

// ============================================================================
// Options
// ============================================================================

/// When to request a server checkpoint. The two modes are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTrigger {
    /// After every `n` executed statements.
    EveryStatements(usize),
    /// After this much elapsed time.
    Every(Duration),
}

/// Probabilistic fault schedule.
///
/// Up to `start_fraction` of the stream the probability is zero; after it
/// the probability rises linearly to `ceiling` at the last statement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultPlan {
    pub start_fraction: f64,
    pub ceiling: f64,
    /// Inject before the last statement if the ramp never fired.
    pub force_by_end: bool,
    pub seed: u64,
}

impl FaultPlan {
    /// Index of the first statement with a non-zero probability.
    pub fn start_index(&self, total: usize) -> usize {
        (total as f64 * self.start_fraction).floor() as usize + 1
    }

    /// Injection probability before sending statement `index` of `total`.
    pub fn probability(&self, index: usize, total: usize) -> f64 {
        let start = self.start_index(total);
        if total == 0 || index < start {
            return 0.0;
        }
        let last = total - 1;
        if last <= start {
            return self.ceiling;
        }
        let ramp = (index - start + 1) as f64 / (last - start + 1) as f64;
        (self.ceiling * ramp).clamp(0.0, 1.0)
    }

    fn fires(&self, rng: &mut StdRng, index: usize, total: usize) -> bool {
        if self.force_by_end && index + 1 == total {
            return true;
        }
        let p = self.probability(index, total);
        p > 0.0 && rng.gen_bool(p)
    }
}

/// Driver settings.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub checkpoint: Option<CheckpointTrigger>,
    pub checkpoint_statement: String,
    /// Statements slower than this are flagged, not failed.
    pub slow_threshold: Duration,
    pub fault: Option<FaultPlan>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            checkpoint: None,
            checkpoint_statement: "CREATE STATIC_CHECKPOINT;".to_string(),
            slow_threshold: Duration::from_secs(1),
            fault: None,
        }
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Why a driver stopped sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    /// This driver injected the fault.
    Faulted,
    /// Another driver injected the fault.
    Cancelled,
    /// The connection died without a fault being signalled.
    ConnectionLost,
    /// The driver thread panicked.
    Panicked,
}

/// A statement that exceeded the slow threshold.
#[derive(Debug, Clone, Serialize)]
pub struct SlowStatement {
    pub index: usize,
    pub sql: String,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
}

/// Outcome of one driver run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub session: String,
    pub total: usize,
    /// Statements sent to the server, checkpoints included.
    pub executed: usize,
    pub succeeded: usize,
    pub sql_errors: usize,
    pub aborted_txns: usize,
    /// Statements skipped after their transaction aborted.
    pub skipped: usize,
    pub checkpoints: usize,
    pub slow: Vec<SlowStatement>,
    pub fault: Option<FaultEvent>,
    pub fault_error: Option<String>,
    pub transport_error: Option<String>,
    pub stop: StopReason,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    pub records: Vec<StatementRecord>,
    #[serde(skip)]
    pub ledger: SessionLedger,
}

impl ExecutionReport {
    fn new(session: &str, total: usize) -> Self {
        Self {
            session: session.to_string(),
            total,
            executed: 0,
            succeeded: 0,
            sql_errors: 0,
            aborted_txns: 0,
            skipped: 0,
            checkpoints: 0,
            slow: Vec::new(),
            fault: None,
            fault_error: None,
            transport_error: None,
            stop: StopReason::Completed,
            elapsed: Duration::ZERO,
            records: Vec::new(),
            ledger: SessionLedger::new(),
        }
    }

    fn panicked(session: &str, total: usize) -> Self {
        Self {
            stop: StopReason::Panicked,
            ..Self::new(session, total)
        }
    }

    /// SQL errors as a fraction of executed statements.
    pub fn sql_error_rate(&self) -> f64 {
        if self.executed == 0 {
            0.0
        } else {
            self.sql_errors as f64 / self.executed as f64
        }
    }
}

/// Statements for one concurrent session.
#[derive(Debug, Clone)]
pub struct SessionWork {
    pub label: String,
    pub statements: Vec<Statement>,
}

// ============================================================================
// Driver
// ============================================================================

/// Runs statement streams.
#[derive(Debug, Clone, Default)]
pub struct WorkloadDriver {
    options: DriverOptions,
}

impl WorkloadDriver {
    pub fn new(options: DriverOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    /// Executes schema and bulk-load statements; every one must succeed.
    pub fn setup(
        &self,
        session: &mut Session,
        statements: &[Statement],
    ) -> Result<usize, WorkloadError> {
        for (index, statement) in statements.iter().enumerate() {
            let response = session
                .execute(&statement.sql)
                .map_err(|source| WorkloadError::Setup { index, source })?;
            if !response.is_ok() {
                return Err(WorkloadError::SetupRejected {
                    index,
                    statement: statement.sql.clone(),
                    response: response.text,
                });
            }
        }
        debug!(session = %session.label(), statements = statements.len(), "setup complete");
        Ok(statements.len())
    }

    /// Executes `statements` in order on `session`.
    ///
    /// With a fault hook, the fault is injected before the first statement
    /// the [`FaultPlan`] selects, or at a crash marker, and nothing further
    /// is sent.
    pub fn run(
        &self,
        session: &mut Session,
        statements: &[Statement],
        fault: Option<&dyn FaultHook>,
    ) -> ExecutionReport {
        let started = Instant::now();
        let total = statements.len();
        let mut report = ExecutionReport::new(session.label(), total);
        let mut ledger = SessionLedger::new();
        let mut rng = StdRng::seed_from_u64(self.options.fault.map_or(0, |plan| plan.seed));

        let mut in_txn = false;
        let mut skipping = false;
        let mut since_checkpoint = 0usize;
        let mut last_checkpoint = Instant::now();

        for (index, statement) in statements.iter().enumerate() {
            if let Some(hook) = fault {
                let due = statement.is_crash_marker()
                    || self
                        .options
                        .fault
                        .is_some_and(|plan| plan.fires(&mut rng, index, total));
                if due {
                    let progress = FaultProgress {
                        statement_index: index,
                        total,
                        elapsed: started.elapsed(),
                    };
                    match hook.inject(progress) {
                        Ok(event) => report.fault = Some(event),
                        Err(e) => {
                            warn!(session = %session.label(), error = %e, "fault injection failed");
                            report.fault_error = Some(e.to_string());
                        }
                    }
                    report.stop = StopReason::Faulted;
                    break;
                }
            }

            if statement.is_crash_marker() {
                report.skipped += 1;
                continue;
            }

            if skipping {
                report.skipped += 1;
                if statement.kind.ends_transaction() {
                    skipping = false;
                }
                continue;
            }

            if !in_txn && self.checkpoint_due(since_checkpoint, last_checkpoint) {
                since_checkpoint = 0;
                last_checkpoint = Instant::now();
                report.executed += 1;
                match session.execute(&self.options.checkpoint_statement) {
                    Ok(response) if response.is_ok() => {
                        report.succeeded += 1;
                        report.checkpoints += 1;
                    }
                    Ok(response) => {
                        report.sql_errors += 1;
                        warn!(session = %session.label(), response = %response.text, "checkpoint rejected");
                    }
                    Err(e) => {
                        Self::stop_on_error(&mut report, session, &e);
                        break;
                    }
                }
            }

            if !matches!(
                statement.kind,
                StatementKind::Checkpoint | StatementKind::Begin | StatementKind::Commit
            ) {
                since_checkpoint += 1;
            }

            let response = match session.execute(&statement.sql) {
                Ok(response) => response,
                Err(e) => {
                    if matches!(e, SessionError::Send(_)) {
                        report.executed += 1;
                        match statement.kind {
                            StatementKind::Commit if in_txn => ledger.commit_in_flight(),
                            _ if !in_txn => {
                                if let Some(effect) = &statement.effect {
                                    ledger.write_in_flight(effect.clone());
                                }
                            }
                            _ => ledger.discard(),
                        }
                    }
                    Self::stop_on_error(&mut report, session, &e);
                    break;
                }
            };
            report.executed += 1;

            if response.elapsed >= self.options.slow_threshold {
                report.slow.push(SlowStatement {
                    index,
                    sql: statement.sql.clone(),
                    latency: response.elapsed,
                });
            }

            match response.status {
                ResponseStatus::Ok => {
                    report.succeeded += 1;
                    match statement.kind {
                        StatementKind::Begin => in_txn = true,
                        StatementKind::Commit => {
                            ledger.commit();
                            in_txn = false;
                        }
                        StatementKind::Rollback => {
                            ledger.discard();
                            in_txn = false;
                        }
                        StatementKind::Checkpoint => {
                            report.checkpoints += 1;
                            since_checkpoint = 0;
                            last_checkpoint = Instant::now();
                        }
                        _ => {
                            if let Some(effect) = &statement.effect {
                                if in_txn {
                                    ledger.stage(effect.clone());
                                } else {
                                    ledger.apply(effect.clone());
                                }
                            }
                        }
                    }
                }
                ResponseStatus::Aborted => {
                    report.aborted_txns += 1;
                    ledger.discard();
                    if in_txn && !statement.kind.ends_transaction() {
                        skipping = true;
                    }
                    in_txn = false;
                }
                ResponseStatus::SqlError => {
                    report.sql_errors += 1;
                    match statement.kind {
                        StatementKind::Commit => {
                            report.aborted_txns += 1;
                            ledger.discard();
                            in_txn = false;
                        }
                        StatementKind::Rollback => {
                            ledger.discard();
                            in_txn = false;
                        }
                        StatementKind::Begin => skipping = true,
                        _ => {}
                    }
                }
            }
        }

        if ledger.has_pending() {
            // Open at the stop; none of it may survive.
            ledger.discard();
        }

        report.elapsed = started.elapsed();
        report.records = session.take_log();
        report.ledger = ledger;
        info!(
            session = %report.session,
            executed = report.executed,
            succeeded = report.succeeded,
            sql_errors = report.sql_errors,
            stop = ?report.stop,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "workload finished"
        );
        report
    }

    /// Runs one driver per entry of `work` on its own thread.
    ///
    /// All sessions start together. Only the first may inject `fault`.
    /// Reports are returned in `work` order.
    pub fn run_concurrent(
        &self,
        factory: &SessionFactory,
        work: Vec<SessionWork>,
        fault: Option<&dyn FaultHook>,
    ) -> Vec<ExecutionReport> {
        let start = Barrier::new(work.len());

        thread::scope(|scope| {
            let handles: Vec<_> = work
                .into_iter()
                .enumerate()
                .map(|(i, work)| {
                    let start = &start;
                    let hook = if i == 0 { fault } else { None };
                    let label = work.label.clone();
                    let total = work.statements.len();
                    let handle = scope.spawn(move || {
                        let mut session = factory.open(&work.label);
                        start.wait();
                        let report = self.run(&mut session, &work.statements, hook);
                        session.close();
                        report
                    });
                    (label, total, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(label, total, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        warn!(session = %label, "driver thread panicked");
                        ExecutionReport::panicked(&label, total)
                    })
                })
                .collect()
        })
    }

    fn checkpoint_due(&self, since: usize, last: Instant) -> bool {
        match self.options.checkpoint {
            Some(CheckpointTrigger::EveryStatements(n)) => n > 0 && since >= n,
            Some(CheckpointTrigger::Every(period)) => last.elapsed() >= period,
            None => false,
        }
    }

    fn stop_on_error(report: &mut ExecutionReport, session: &Session, error: &SessionError) {
        report.stop = match error {
            SessionError::Cancelled(_) => StopReason::Cancelled,
            _ if session.is_cancelled() => StopReason::Cancelled,
            _ => StopReason::ConnectionLost,
        };
        if !matches!(error, SessionError::Cancelled(_)) {
            report.transport_error = Some(error.to_string());
        }
        debug!(session = %session.label(), error = %error, stop = ?report.stop, "driver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn plan(start_fraction: f64, ceiling: f64) -> FaultPlan {
        FaultPlan {
            start_fraction,
            ceiling,
            force_by_end: true,
            seed: 7,
        }
    }

    #[test]
    fn test_probability_is_zero_through_midpoint() {
        let plan = plan(0.5, 0.05);
        for i in 0..=10 {
            assert_eq!(plan.probability(i, 20), 0.0, "index {i}");
        }
        assert!(plan.probability(11, 20) > 0.0);
        assert!((plan.probability(19, 20) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_forced_by_end() {
        let plan = plan(0.5, 0.0);
        let mut rng = StdRng::seed_from_u64(1);
        let fired: Vec<usize> = (0..20).filter(|&i| plan.fires(&mut rng, i, 20)).collect();
        assert_eq!(fired, vec![19]);
    }

    #[test]
    fn test_checkpoint_due_by_count() {
        let driver = WorkloadDriver::new(DriverOptions {
            checkpoint: Some(CheckpointTrigger::EveryStatements(3)),
            ..Default::default()
        });
        let now = Instant::now();
        assert!(!driver.checkpoint_due(2, now));
        assert!(driver.checkpoint_due(3, now));
        assert!(!WorkloadDriver::default().checkpoint_due(100, now));
    }

    proptest! {
        #[test]
        fn prop_probability_monotonic_and_bounded(
            total in 1usize..500,
            start in 0.0f64..0.99,
            ceiling in 0.0f64..=1.0,
        ) {
            let plan = plan(start, ceiling);
            let mut previous = 0.0;
            for i in 0..total {
                let p = plan.probability(i, total);
                prop_assert!((0.0..=ceiling).contains(&p));
                prop_assert!(p >= previous);
                previous = p;
            }
        }
    }
}
