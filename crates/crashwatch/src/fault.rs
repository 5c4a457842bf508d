//! Fault injection.
//!
//! A fault is delivered either as SIGKILL to the server's process group or
//! as the server's own crash statement. Both cancel the shared token first
//! so concurrent drivers stop before their next send, and both return a
//! [`FaultEvent`] whose `at` instant anchors recovery latency.

use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crashwatch_config::FaultModeKind;
use crashwatch_wire::{ClientConfig, WireClient};
use serde::Serialize;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::FaultInjectionError;
use crate::report::duration_ms;
use crate::supervisor::{KillSwitch, ServerHandle};

const DEATH_POLL: Duration = Duration::from_millis(20);

/// How the fault is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultMode {
    /// SIGKILL to the process group.
    Kill,
    /// Send `statement`, then confirm the server stopped accepting
    /// connections within `confirm_within`.
    CrashCommand {
        statement: String,
        confirm_within: Duration,
    },
}

impl FaultMode {
    pub fn kind(&self) -> FaultModeKind {
        match self {
            Self::Kill => FaultModeKind::Kill,
            Self::CrashCommand { .. } => FaultModeKind::CrashCommand,
        }
    }
}

/// Where in the workload the fault lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultProgress {
    /// Index of the first statement that will not be sent.
    pub statement_index: usize,
    pub total: usize,
    /// Time since the workload started.
    pub elapsed: Duration,
}

impl FaultProgress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.statement_index as f64 / self.total as f64
        }
    }
}

/// Record of one injected fault.
#[derive(Debug, Clone, Serialize)]
pub struct FaultEvent {
    pub statement_index: usize,
    pub progress_fraction: f64,
    /// Offset from workload start.
    #[serde(with = "duration_ms")]
    pub offset: Duration,
    pub wall_clock: DateTime<Utc>,
    pub mode: FaultModeKind,
    /// When the fault was confirmed; recovery latency is measured from here.
    #[serde(skip)]
    pub at: Instant,
}

/// Called by the driver that holds fault authority.
pub trait FaultHook: Send + Sync {
    fn inject(&self, progress: FaultProgress) -> Result<FaultEvent, FaultInjectionError>;
}

/// Delivers faults to one server instance.
#[derive(Debug, Clone)]
pub struct FaultInjector {
    mode: FaultMode,
    kill: KillSwitch,
    addr: SocketAddr,
    client: ClientConfig,
    cancel: CancelToken,
}

impl FaultInjector {
    pub fn new(
        mode: FaultMode,
        handle: &ServerHandle,
        client: ClientConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            mode,
            kill: handle.kill_switch(),
            addr: handle.addr(),
            client,
            cancel,
        }
    }

    pub fn mode(&self) -> &FaultMode {
        &self.mode
    }

    /// Injects a fault outside any workload.
    pub fn inject_now(&self) -> Result<FaultEvent, FaultInjectionError> {
        self.inject(FaultProgress {
            statement_index: 0,
            total: 0,
            elapsed: Duration::ZERO,
        })
    }

    fn confirm_dead(&self, within: Duration) -> Result<(), FaultInjectionError> {
        let deadline = Instant::now() + within;
        loop {
            if !accepting(self.addr) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FaultInjectionError::StillAlive(within));
            }
            thread::sleep(DEATH_POLL);
        }
    }
}

impl FaultHook for FaultInjector {
    fn inject(&self, progress: FaultProgress) -> Result<FaultEvent, FaultInjectionError> {
        self.cancel.cancel();

        match &self.mode {
            FaultMode::Kill => self.kill.fire()?,
            FaultMode::CrashCommand {
                statement,
                confirm_within,
            } => {
                // No response is expected; the connection dying is the point.
                let reply = WireClient::send_once(self.addr, &self.client, statement, *confirm_within);
                debug!(reply = ?reply.as_ref().map(|r| &r.text), "crash statement sent");
                self.confirm_dead(*confirm_within)?;
            }
        }

        let event = FaultEvent {
            statement_index: progress.statement_index,
            progress_fraction: progress.fraction(),
            offset: progress.elapsed,
            wall_clock: Utc::now(),
            mode: self.mode.kind(),
            at: Instant::now(),
        };
        info!(
            pid = self.kill.pid(),
            statement_index = event.statement_index,
            progress = event.progress_fraction,
            mode = ?event.mode,
            "fault injected"
        );
        Ok(event)
    }
}

/// True if something accepts TCP connections on `addr`.
pub(crate) fn accepting(addr: SocketAddr) -> bool {
    TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok()
}
