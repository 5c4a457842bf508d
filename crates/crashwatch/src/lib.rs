//! # crashwatch: crash-recovery and isolation harness
//!
//! Drives a database server as a black box over its SQL-over-TCP protocol
//! (see [`crashwatch_wire`]) and checks two properties:
//!
//! - **Crash recovery.** A workload runs while the server is killed at a
//!   randomized point late in the stream. The harness relaunches it, times
//!   recovery and verifies that only acknowledged work survived.
//! - **Snapshot isolation.** Fixed interleavings of two sessions check
//!   repeatable reads, non-blocking readers and write-write conflict aborts.
//!
//! The pieces compose bottom-up:
//!
//! ```text
//! Orchestrator ── per scenario ──► Supervisor (process lifecycle)
//!     │                              │
//!     ├─ WorkloadDriver ─► Session ──┴─► WireClient
//!     │       └─ FaultHook (FaultInjector)
//!     ├─ RecoveryMonitor
//!     ├─ InterleavingController
//!     └─ ConsistencyVerifier ─► ScenarioReport / SuiteReport
//! ```
//!
//! SQL-level failures are data and end up in the reports. Only
//! infrastructure failures surface as [`HarnessError`].

// Process groups and signals are POSIX-only.
#[cfg(not(unix))]
compile_error!("crashwatch supervises servers through POSIX process groups and requires unix");

pub mod cancel;
pub mod error;
pub mod fault;
pub mod interleave;
pub mod recovery;
pub mod report;
pub mod scenario;
pub mod session;
pub mod settings;
pub mod supervisor;
pub mod verify;
pub mod workload;

pub use cancel::CancelToken;
pub use error::{
    ConsistencyViolation, FaultInjectionError, HarnessError, HarnessResult, InterleaveError,
    RecoveryError, SessionError, StartError, SupervisorError, WorkloadError,
};
pub use fault::{FaultEvent, FaultHook, FaultInjector, FaultMode, FaultProgress};
pub use interleave::{
    InterleavingController, InterleavingPlan, InterleavingRun, SessionTranscript, Step, StepRecord,
};
pub use recovery::{IoStats, MonitorSettings, RecoveryMonitor, RecoveryOutcome, RecoveryRecord};
pub use report::{ScenarioReport, SuiteReport};
pub use scenario::{Baseline, CrashProfile, Orchestrator, ScenarioKind};
pub use session::{Session, SessionFactory, StatementRecord, TxnState};
pub use supervisor::{LaunchSpec, ServerHandle, ServerState, Supervisor, SupervisorConfig};
pub use verify::{Check, CheckResult, ConsistencyReport, ConsistencyVerifier, Expectation};
pub use workload::{
    DriverOptions, ExecutionReport, StatementScript, StopReason, TpccGenerator, WorkloadDriver,
    WorkloadGenerator,
};
