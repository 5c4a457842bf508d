//! Workload statement streams and their execution.
//!
//! - [`statement`]: statements, their kinds and expected row effects
//! - [`generator`]: deterministic warehouse-style statement generation
//! - [`ledger`]: expected post-fault state from acknowledged effects
//! - [`script`]: SQL script files with crash markers
//! - [`driver`]: sequential and concurrent execution with checkpoints
//!   and the probabilistic fault hook

pub mod driver;
pub mod generator;
pub mod ledger;
pub mod script;
pub mod statement;

pub use driver::{
    CheckpointTrigger, DriverOptions, ExecutionReport, FaultPlan, SessionWork, SlowStatement,
    StopReason, WorkloadDriver,
};
pub use generator::{SESSION_ID_STRIDE, Table, TpccGenerator, WorkloadGenerator};
pub use ledger::{CountRange, ExpectedState, SessionLedger};
pub use script::StatementScript;
pub use statement::{Effect, Statement, StatementKind};
