//! Harness error types.
//!
//! Infrastructure failures (the server would not start, a connection could
//! not be set up, a fault could not be delivered) are errors. SQL-level
//! failures are data recorded in reports, never errors.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crashwatch_wire::{ConnError, SendError};
use thiserror::Error;

/// Result type for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Errors starting the server process.
#[derive(Debug, Error)]
pub enum StartError {
    /// The server executable does not exist.
    #[error("server binary not found: {}", .0.display())]
    BinaryMissing(PathBuf),

    /// Something is already listening on the server's address.
    #[error("address {0} is already in use")]
    PortBusy(SocketAddr),

    /// The working or log directory could not be prepared.
    #[error("failed to prepare {}: {source}", .path.display())]
    Workdir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The OS refused to launch the process.
    #[error("failed to spawn {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The process exited before it answered the liveness probe.
    #[error("server exited during startup ({status}); stderr: {stderr}")]
    ExitedEarly {
        status: String,
        stdout: String,
        stderr: String,
    },

    /// The liveness probe never succeeded.
    #[error("server did not answer the liveness probe within {0:?}")]
    Timeout(Duration),
}

/// Errors controlling a running server process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A signal could not be delivered to the process group.
    #[error("failed to signal process group {pgid}: {source}")]
    Signal {
        pgid: i32,
        #[source]
        source: io::Error,
    },

    /// The process survived SIGKILL past the reap bound.
    #[error("server process {pid} still running {timeout:?} after SIGKILL")]
    Unkillable { pid: u32, timeout: Duration },
}

/// Errors delivering a fault.
#[derive(Debug, Error)]
pub enum FaultInjectionError {
    /// The crash statement reached the server but it kept serving.
    #[error("server still accepting connections {0:?} after the crash statement")]
    StillAlive(Duration),

    /// The kill signal could not be delivered.
    #[error(transparent)]
    Kill(#[from] SupervisorError),
}

/// Harness errors during a recovery episode.
///
/// A recovery that merely takes too long is not an error; it is reported
/// as `RecoveryOutcome::TimedOut`.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The faulted server kept accepting connections.
    #[error("faulted server still accepting connections after {0:?}")]
    StillAlive(Duration),

    /// A lingering faulted process could not be reaped.
    #[error(transparent)]
    Reap(#[from] SupervisorError),

    /// The server could not be relaunched.
    #[error("restart failed: {0}")]
    Restart(#[from] StartError),

    /// The relaunched server exited while recovering.
    #[error("server exited during recovery ({status}); stderr: {stderr}")]
    Exited { status: String, stderr: String },
}

/// Errors from an interleaving run.
#[derive(Debug, Error)]
pub enum InterleaveError {
    /// The plan is malformed or cannot complete.
    #[error("invalid interleaving plan: {0}")]
    InvalidPlan(String),

    /// A session waited on a barrier past the deadlock bound.
    #[error("session `{session}` waited more than {timeout:?} on barrier `{barrier}`")]
    BarrierTimeout {
        session: String,
        barrier: String,
        timeout: Duration,
    },

    /// A session could not connect before the run.
    #[error("session `{session}` failed to connect: {source}")]
    Connect {
        session: String,
        #[source]
        source: ConnError,
    },

    /// A session thread panicked.
    #[error("session thread `{0}` panicked")]
    SessionPanicked(String),
}

/// Errors executing a statement on a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The shared cancellation token was set before the statement was sent.
    #[error("session `{0}` cancelled")]
    Cancelled(String),

    /// The connection carrying an open transaction is gone.
    #[error("session `{0}`: connection lost with a transaction open")]
    TransactionLost(String),

    /// The round trip failed.
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Errors executing a workload.
#[derive(Debug, Error)]
pub enum WorkloadError {
    /// A schema or bulk load statement was rejected.
    #[error("setup statement {index} rejected: {response} (statement: {statement})")]
    SetupRejected {
        index: usize,
        statement: String,
        response: String,
    },

    /// A setup statement could not be delivered.
    #[error("setup statement {index} failed: {source}")]
    Setup {
        index: usize,
        #[source]
        source: SessionError,
    },

    /// A statement script could not be read.
    #[error("failed to read script {}: {source}", .path.display())]
    Script {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One or more consistency checks failed.
#[derive(Debug, Error)]
#[error("{} consistency check(s) failed: {}", .failed.len(), .failed.join(", "))]
pub struct ConsistencyViolation {
    pub failed: Vec<String>,
}

/// Top-level harness error.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("start failed: {0}")]
    Start(#[from] StartError),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("fault injection failed: {0}")]
    Fault(#[from] FaultInjectionError),

    #[error("recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("interleaving failed: {0}")]
    Interleave(#[from] InterleaveError),

    #[error("workload failed: {0}")]
    Workload(#[from] WorkloadError),

    #[error("connection failed: {0}")]
    Conn(#[from] ConnError),

    #[error(transparent)]
    Consistency(#[from] ConsistencyViolation),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
