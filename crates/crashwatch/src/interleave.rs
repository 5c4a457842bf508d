//! Deterministic cross-session interleavings.
//!
//! A plan is a list of steps, each owned by one session: a statement, a
//! barrier signal, or a barrier wait. Every session runs its own steps in
//! order on its own thread and connection. A signal step sends the barrier
//! name to the controller thread, which releases it; a waiting session
//! sends nothing until its barrier is released. Cross-session order is
//! therefore fixed at the dispatch boundary, and a wait that outlives the
//! barrier timeout is reported as a suspected deadlock.
//!
//! ```text
//! A: BEGIN; SELECT (a1); signal(read) ............ wait(wrote); SELECT (a2)
//! B: ................... wait(read); UPDATE; COMMIT; signal(wrote)
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use crashwatch_wire::ResponseStatus;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::InterleaveError;
use crate::session::{Session, SessionFactory, TxnState};

// ============================================================================
// Plan
// ============================================================================

/// One step of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Exec { label: Option<String>, sql: String },
    Signal(String),
    Wait(String),
}

/// Sessions and their ordered steps.
#[derive(Debug, Clone, Default)]
pub struct InterleavingPlan {
    sessions: Vec<String>,
    steps: Vec<(String, Step)>,
}

impl InterleavingPlan {
    pub fn new<S: Into<String>>(sessions: impl IntoIterator<Item = S>) -> Self {
        Self {
            sessions: sessions.into_iter().map(Into::into).collect(),
            steps: Vec::new(),
        }
    }

    pub fn exec(mut self, session: &str, sql: impl Into<String>) -> Self {
        self.steps.push((
            session.to_string(),
            Step::Exec {
                label: None,
                sql: sql.into(),
            },
        ));
        self
    }

    /// A statement whose transcript entry can be looked up by `label`.
    pub fn exec_as(mut self, session: &str, label: &str, sql: impl Into<String>) -> Self {
        self.steps.push((
            session.to_string(),
            Step::Exec {
                label: Some(label.to_string()),
                sql: sql.into(),
            },
        ));
        self
    }

    pub fn signal(mut self, session: &str, barrier: &str) -> Self {
        self.steps
            .push((session.to_string(), Step::Signal(barrier.to_string())));
        self
    }

    pub fn wait(mut self, session: &str, barrier: &str) -> Self {
        self.steps
            .push((session.to_string(), Step::Wait(barrier.to_string())));
        self
    }

    pub fn sessions(&self) -> &[String] {
        &self.sessions
    }

    /// Steps of `session` in plan order.
    pub fn steps_of(&self, session: &str) -> Vec<Step> {
        self.steps
            .iter()
            .filter(|(owner, _)| owner == session)
            .map(|(_, step)| step.clone())
            .collect()
    }

    /// Checks the plan's shape and that it can run to completion.
    pub fn validate(&self) -> Result<(), InterleaveError> {
        let invalid = |msg: String| Err(InterleaveError::InvalidPlan(msg));

        if self.sessions.is_empty() {
            return invalid("no sessions".into());
        }
        let names: BTreeSet<&str> = self.sessions.iter().map(String::as_str).collect();
        if names.len() != self.sessions.len() {
            return invalid("duplicate session names".into());
        }

        let mut producers: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut consumers: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut labels = BTreeSet::new();
        for (session, step) in &self.steps {
            if !names.contains(session.as_str()) {
                return invalid(format!("step for unknown session `{session}`"));
            }
            match step {
                Step::Exec {
                    label: Some(label), ..
                } if !labels.insert(label.as_str()) => {
                    return invalid(format!("duplicate step label `{label}`"));
                }
                Step::Exec { .. } => {}
                Step::Signal(barrier) => producers
                    .entry(barrier.as_str())
                    .or_default()
                    .push(session.as_str()),
                Step::Wait(barrier) => consumers
                    .entry(barrier.as_str())
                    .or_default()
                    .push(session.as_str()),
            }
        }

        for (barrier, signallers) in &producers {
            if signallers.len() != 1 {
                return invalid(format!("barrier `{barrier}` is signalled {} times", signallers.len()));
            }
            let Some(waiters) = consumers.get(barrier) else {
                return invalid(format!("barrier `{barrier}` has no waiters"));
            };
            if waiters.contains(&signallers[0]) {
                return invalid(format!(
                    "session `{}` waits on its own barrier `{barrier}`",
                    signallers[0]
                ));
            }
        }
        if let Some(barrier) = consumers.keys().find(|b| !producers.contains_key(*b)) {
            return invalid(format!("barrier `{barrier}` is never signalled"));
        }

        self.check_completes()
    }

    /// Simulates the plan and fails if some session can never proceed.
    fn check_completes(&self) -> Result<(), InterleaveError> {
        let queues: Vec<Vec<Step>> = self.sessions.iter().map(|s| self.steps_of(s)).collect();
        let mut cursors = vec![0usize; queues.len()];
        let mut released: HashSet<&str> = HashSet::new();

        loop {
            let mut progressed = false;
            for (queue, cursor) in queues.iter().zip(cursors.iter_mut()) {
                while let Some(step) = queue.get(*cursor) {
                    match step {
                        Step::Wait(barrier) if !released.contains(barrier.as_str()) => break,
                        Step::Signal(barrier) => {
                            released.insert(barrier.as_str());
                        }
                        _ => {}
                    }
                    *cursor += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        let stuck: Vec<String> = self
            .sessions
            .iter()
            .zip(queues.iter().zip(&cursors))
            .filter_map(|(name, (queue, cursor))| match queue.get(*cursor) {
                Some(Step::Wait(barrier)) => Some(format!("{name} on `{barrier}`")),
                _ => None,
            })
            .collect();
        if stuck.is_empty() {
            Ok(())
        } else {
            Err(InterleaveError::InvalidPlan(format!(
                "plan deadlocks: {}",
                stuck.join(", ")
            )))
        }
    }
}

// ============================================================================
// Transcripts
// ============================================================================

/// A statement executed by one session.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub session: String,
    pub label: Option<String>,
    pub sql: String,
    pub status: Option<ResponseStatus>,
    pub response: Option<String>,
    pub error: Option<String>,
    /// Global sequence number taken just before the statement was sent.
    pub dispatched: u64,
    /// Global sequence number taken when the round trip ended.
    pub completed: u64,
    pub latency_ms: f64,
}

impl StepRecord {
    pub fn is_ok(&self) -> bool {
        self.status.is_some_and(ResponseStatus::is_ok)
    }

    /// Finished before `other` was sent.
    pub fn happened_before(&self, other: &StepRecord) -> bool {
        self.completed < other.dispatched
    }
}

/// Everything one session did.
#[derive(Debug, Clone, Serialize)]
pub struct SessionTranscript {
    pub session: String,
    pub steps: Vec<StepRecord>,
    pub final_txn: TxnState,
    /// Set when the session stopped at a barrier timeout.
    pub stalled_at: Option<String>,
}

/// Result of an interleaving run.
#[derive(Debug)]
pub struct InterleavingRun {
    pub transcripts: Vec<SessionTranscript>,
    /// Barrier timeouts and panicked sessions.
    pub failures: Vec<InterleaveError>,
}

impl InterleavingRun {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// The step executed under `label`.
    pub fn step(&self, label: &str) -> Option<&StepRecord> {
        self.transcripts
            .iter()
            .flat_map(|t| &t.steps)
            .find(|s| s.label.as_deref() == Some(label))
    }

    pub fn transcript(&self, session: &str) -> Option<&SessionTranscript> {
        self.transcripts.iter().find(|t| t.session == session)
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Barriers released by the controller thread.
#[derive(Debug, Default)]
struct Rendezvous {
    released: Mutex<HashSet<String>>,
    cond: Condvar,
}

impl Rendezvous {
    fn release(&self, barrier: &str) {
        let mut released = self
            .released
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        released.insert(barrier.to_string());
        self.cond.notify_all();
    }

    /// True once `barrier` is released; false after `timeout`.
    fn wait(&self, barrier: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut released = self
            .released
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while !released.contains(barrier) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            released = match self.cond.wait_timeout(released, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

struct SessionOutcome {
    transcript: SessionTranscript,
    failure: Option<InterleaveError>,
}

/// Runs a validated plan.
#[derive(Debug, Clone)]
pub struct InterleavingController {
    plan: InterleavingPlan,
}

impl InterleavingController {
    pub fn define(plan: InterleavingPlan) -> Result<Self, InterleaveError> {
        plan.validate()?;
        Ok(Self { plan })
    }

    pub fn plan(&self) -> &InterleavingPlan {
        &self.plan
    }

    /// Connects every session, then runs all of them concurrently.
    ///
    /// Statement failures are recorded in the transcripts and do not stop a
    /// session. A barrier timeout stops the waiting session and is reported
    /// in [`InterleavingRun::failures`].
    pub fn run(
        &self,
        factory: &SessionFactory,
        barrier_timeout: Duration,
    ) -> Result<InterleavingRun, InterleaveError> {
        let mut sessions = Vec::with_capacity(self.plan.sessions.len());
        for name in &self.plan.sessions {
            let mut session = factory.open(name);
            session
                .connect()
                .map_err(|source| InterleaveError::Connect {
                    session: name.clone(),
                    source,
                })?;
            sessions.push(session);
        }

        let rendezvous = Rendezvous::default();
        let sequence = AtomicU64::new(0);
        let (signals, inbox) = mpsc::channel::<String>();

        let outcomes = thread::scope(|scope| {
            let handles: Vec<_> = sessions
                .into_iter()
                .map(|session| {
                    let name = session.label().to_string();
                    let steps = self.plan.steps_of(&name);
                    let signals = signals.clone();
                    let rendezvous = &rendezvous;
                    let sequence = &sequence;
                    let handle = scope.spawn(move || {
                        run_session(session, steps, &signals, rendezvous, sequence, barrier_timeout)
                    });
                    (name, handle)
                })
                .collect();
            drop(signals);

            // Ends once every session thread has dropped its sender.
            for barrier in inbox {
                debug!(barrier = %barrier, "releasing barrier");
                rendezvous.release(&barrier);
            }

            handles
                .into_iter()
                .map(|(name, handle)| {
                    handle.join().unwrap_or_else(|_| SessionOutcome {
                        transcript: SessionTranscript {
                            session: name.clone(),
                            steps: Vec::new(),
                            final_txn: TxnState::None,
                            stalled_at: None,
                        },
                        failure: Some(InterleaveError::SessionPanicked(name)),
                    })
                })
                .collect::<Vec<_>>()
        });

        let mut run = InterleavingRun {
            transcripts: Vec::with_capacity(outcomes.len()),
            failures: Vec::new(),
        };
        for outcome in outcomes {
            run.transcripts.push(outcome.transcript);
            run.failures.extend(outcome.failure);
        }
        info!(
            sessions = run.transcripts.len(),
            failures = run.failures.len(),
            "interleaving finished"
        );
        Ok(run)
    }
}

fn run_session(
    mut session: Session,
    steps: Vec<Step>,
    signals: &mpsc::Sender<String>,
    rendezvous: &Rendezvous,
    sequence: &AtomicU64,
    barrier_timeout: Duration,
) -> SessionOutcome {
    let name = session.label().to_string();
    let mut records = Vec::new();
    let mut failure = None;
    let mut stalled_at = None;

    for step in steps {
        match step {
            Step::Exec { label, sql } => {
                let dispatched = sequence.fetch_add(1, Ordering::SeqCst);
                let result = session.execute(&sql);
                let completed = sequence.fetch_add(1, Ordering::SeqCst);
                let (status, response, error, latency_ms) = match result {
                    Ok(r) => (
                        Some(r.status),
                        Some(r.text),
                        None,
                        r.elapsed.as_secs_f64() * 1000.0,
                    ),
                    Err(e) => (None, None, Some(e.to_string()), 0.0),
                };
                records.push(StepRecord {
                    session: name.clone(),
                    label,
                    sql,
                    status,
                    response,
                    error,
                    dispatched,
                    completed,
                    latency_ms,
                });
            }
            Step::Signal(barrier) => {
                // The controller outlives every sender, so this cannot fail
                // while the run is active.
                let _ = signals.send(barrier);
            }
            Step::Wait(barrier) => {
                if !rendezvous.wait(&barrier, barrier_timeout) {
                    warn!(session = %name, barrier = %barrier, "barrier wait timed out");
                    failure = Some(InterleaveError::BarrierTimeout {
                        session: name.clone(),
                        barrier: barrier.clone(),
                        timeout: barrier_timeout,
                    });
                    stalled_at = Some(barrier);
                    break;
                }
            }
        }
    }

    let final_txn = session.txn_state();
    session.close();
    SessionOutcome {
        transcript: SessionTranscript {
            session: name,
            steps: records,
            final_txn,
            stalled_at,
        },
        failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_session_plan() -> InterleavingPlan {
        InterleavingPlan::new(["A", "B"])
            .exec("A", "BEGIN;")
            .exec_as("A", "a1", "SELECT val FROM t WHERE id = 1;")
            .signal("A", "read")
            .wait("B", "read")
            .exec("B", "UPDATE t SET val = 2 WHERE id = 1;")
            .signal("B", "wrote")
            .wait("A", "wrote")
            .exec_as("A", "a2", "SELECT val FROM t WHERE id = 1;")
    }

    #[test]
    fn test_valid_plan() {
        two_session_plan().validate().unwrap();
        assert_eq!(two_session_plan().steps_of("B").len(), 3);
    }

    #[test]
    fn test_rejects_unknown_session() {
        let plan = InterleavingPlan::new(["A"]).exec("B", "SELECT 1;");
        assert!(matches!(plan.validate(), Err(InterleaveError::InvalidPlan(_))));
    }

    #[test]
    fn test_rejects_double_signal_and_missing_waiter() {
        let double = InterleavingPlan::new(["A", "B"])
            .signal("A", "x")
            .signal("A", "x")
            .wait("B", "x");
        assert!(double.validate().is_err());

        let orphan = InterleavingPlan::new(["A", "B"]).signal("A", "x");
        assert!(orphan.validate().is_err());

        let unsignalled = InterleavingPlan::new(["A", "B"]).wait("B", "x");
        assert!(unsignalled.validate().is_err());
    }

    #[test]
    fn test_rejects_self_wait() {
        let plan = InterleavingPlan::new(["A", "B"])
            .signal("A", "x")
            .wait("A", "x")
            .wait("B", "x");
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_rejects_cyclic_waits() {
        let plan = InterleavingPlan::new(["A", "B"])
            .wait("A", "y")
            .signal("A", "x")
            .wait("B", "x")
            .signal("B", "y");
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("deadlocks"), "{err}");
    }

    #[test]
    fn test_rendezvous_release_and_timeout() {
        let rendezvous = Rendezvous::default();
        assert!(!rendezvous.wait("x", Duration::from_millis(20)));
        rendezvous.release("x");
        assert!(rendezvous.wait("x", Duration::from_millis(20)));
    }
}
