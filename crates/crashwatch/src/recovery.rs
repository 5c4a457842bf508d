//! Recovery monitoring.
//!
//! After a fault the monitor walks
//! `WaitingForDeath -> Restarting -> Probing -> {Recovered | TimedOut}`:
//! it confirms the old process stopped accepting connections, relaunches
//! the same instance on the same on-disk state, and polls the liveness
//! probe. Latency is measured from the fault event, not from the restart.
//!
//! Recovery-phase and I/O statistics statements are optional server
//! features. An error response disables the phase query for the rest of the
//! episode and leaves statistics unknown; neither affects the outcome.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use crashwatch_wire::{ClientConfig, ResponseStatus, WireClient};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::RecoveryError;
use crate::fault::{FaultEvent, accepting};
use crate::report::duration_ms;
use crate::supervisor::{ServerHandle, ServerState, Supervisor};

/// Stages of one recovery episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStage {
    WaitingForDeath,
    Restarting,
    Probing,
}

/// Terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Recovered,
    TimedOut,
}

/// The server reported a new recovery phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseTransition {
    pub phase: String,
    /// Offset from the fault.
    #[serde(with = "duration_ms")]
    pub at: Duration,
}

/// Entry into a recovery stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageEntry {
    pub stage: RecoveryStage,
    #[serde(with = "duration_ms")]
    pub at: Duration,
}

/// Server-reported I/O counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IoStats {
    pub total_io: Option<u64>,
    pub read_pages: Option<u64>,
    pub write_pages: Option<u64>,
    /// The response as received.
    pub raw: String,
}

impl IoStats {
    /// Parses a JSON object, or `key: value` / `key=value` pairs.
    pub fn parse(text: &str) -> Self {
        let mut stats = Self {
            raw: text.to_string(),
            ..Self::default()
        };

        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(text) {
            let field = |name: &str| map.get(name).and_then(serde_json::Value::as_u64);
            stats.total_io = field("total_io");
            stats.read_pages = field("read_pages");
            stats.write_pages = field("write_pages");
            return stats;
        }

        for pair in text.split(|c: char| c == ',' || c == '\n' || c == '|') {
            let Some((key, value)) = pair.split_once([':', '=']) else {
                continue;
            };
            let value = value.trim().parse::<u64>().ok();
            match key.trim().to_ascii_lowercase().as_str() {
                "total_io" => stats.total_io = value,
                "read_pages" => stats.read_pages = value,
                "write_pages" => stats.write_pages = value,
                _ => {}
            }
        }
        stats
    }
}

/// Result of one recovery episode.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryRecord {
    /// From the fault event to the first successful probe, or to the
    /// deadline when timed out.
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    pub outcome: RecoveryOutcome,
    pub stages: Vec<StageEntry>,
    pub phases: Vec<PhaseTransition>,
    pub io: Option<IoStats>,
    pub probes: u32,
}

impl RecoveryRecord {
    pub fn recovered(&self) -> bool {
        self.outcome == RecoveryOutcome::Recovered
    }
}

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub probe_statement: String,
    pub probe_timeout: Duration,
    pub poll_interval: Duration,
    /// Outer bound, measured from the fault.
    pub timeout: Duration,
    /// Bound on the old process going silent.
    pub death_timeout: Duration,
    pub phase_statement: Option<String>,
    pub io_stats_statement: Option<String>,
    pub client: ClientConfig,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            probe_statement: "SELECT 1;".to_string(),
            probe_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(180),
            death_timeout: Duration::from_secs(5),
            phase_statement: Some("SHOW RECOVERY PHASE;".to_string()),
            io_stats_statement: Some("SHOW IO STATISTICS;".to_string()),
            client: ClientConfig::default(),
        }
    }
}

enum PhaseReply {
    Phase(String),
    Unsupported,
    Unreachable,
}

/// Drives recovery episodes.
#[derive(Debug, Clone, Default)]
pub struct RecoveryMonitor {
    settings: MonitorSettings,
}

impl RecoveryMonitor {
    pub fn new(settings: MonitorSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Waits out the faulted process, relaunches it and probes until it
    /// answers or the deadline passes.
    ///
    /// On return `handle` refers to the relaunched process. A timeout is a
    /// record with `TimedOut`, not an error.
    #[instrument(skip_all, fields(instance = %handle.spec().instance))]
    pub fn await_recovery(
        &self,
        supervisor: &mut Supervisor,
        handle: &mut ServerHandle,
        fault: &FaultEvent,
    ) -> Result<RecoveryRecord, RecoveryError> {
        let mut stages = Vec::new();
        let addr = handle.addr();

        stages.push(StageEntry {
            stage: RecoveryStage::WaitingForDeath,
            at: fault.at.elapsed(),
        });
        self.wait_for_death(addr)?;
        if supervisor.is_alive(handle) {
            warn!(pid = handle.pid(), "faulted process closed its port but is still running; killing it");
            supervisor.kill(handle)?;
        }
        handle.set_state(ServerState::Crashed);

        stages.push(StageEntry {
            stage: RecoveryStage::Restarting,
            at: fault.at.elapsed(),
        });
        let mut restarted = supervisor.spawn(handle.spec())?;
        restarted.set_state(ServerState::Recovering);
        *handle = restarted;

        stages.push(StageEntry {
            stage: RecoveryStage::Probing,
            at: fault.at.elapsed(),
        });
        let deadline = fault.at + self.settings.timeout;
        let mut phases: Vec<PhaseTransition> = Vec::new();
        let mut phase_statement = self.settings.phase_statement.as_deref();
        let mut probes = 0u32;

        let outcome = loop {
            if let Some(status) = handle.poll_exit() {
                handle.set_state(ServerState::Crashed);
                return Err(RecoveryError::Exited {
                    status: status.to_string(),
                    stderr: handle.captured_stderr(),
                });
            }

            probes += 1;
            if self.probe(addr) {
                break RecoveryOutcome::Recovered;
            }

            if let Some(statement) = phase_statement {
                match self.query_phase(addr, statement) {
                    PhaseReply::Phase(phase) => {
                        if phases.last().is_none_or(|last| last.phase != phase) {
                            debug!(phase = %phase, "recovery phase changed");
                            phases.push(PhaseTransition {
                                phase,
                                at: fault.at.elapsed(),
                            });
                        }
                    }
                    PhaseReply::Unsupported => phase_statement = None,
                    PhaseReply::Unreachable => {}
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break RecoveryOutcome::TimedOut;
            }
            thread::sleep(self.settings.poll_interval.min(deadline - now));
        };

        let latency = fault.at.elapsed();
        let io = match outcome {
            RecoveryOutcome::Recovered => {
                handle.set_state(ServerState::Running);
                self.io_stats(addr)
            }
            RecoveryOutcome::TimedOut => None,
        };

        info!(
            outcome = ?outcome,
            latency_ms = latency.as_millis() as u64,
            probes,
            phases = phases.len(),
            "recovery finished"
        );
        Ok(RecoveryRecord {
            latency,
            outcome,
            stages,
            phases,
            io,
            probes,
        })
    }

    fn wait_for_death(&self, addr: SocketAddr) -> Result<(), RecoveryError> {
        let deadline = Instant::now() + self.settings.death_timeout;
        while accepting(addr) {
            if Instant::now() >= deadline {
                return Err(RecoveryError::StillAlive(self.settings.death_timeout));
            }
            thread::sleep(Duration::from_millis(20));
        }
        Ok(())
    }

    fn probe(&self, addr: SocketAddr) -> bool {
        WireClient::send_once(
            addr,
            &self.settings.client,
            &self.settings.probe_statement,
            self.settings.probe_timeout,
        )
        .is_ok_and(|r| r.is_ok())
    }

    fn query_phase(&self, addr: SocketAddr, statement: &str) -> PhaseReply {
        match WireClient::send_once(addr, &self.settings.client, statement, self.settings.probe_timeout)
        {
            Ok(response) if response.status == ResponseStatus::Ok => {
                PhaseReply::Phase(parse_phase(&response.text))
            }
            Ok(_) => PhaseReply::Unsupported,
            Err(_) => PhaseReply::Unreachable,
        }
    }

    fn io_stats(&self, addr: SocketAddr) -> Option<IoStats> {
        let statement = self.settings.io_stats_statement.as_deref()?;
        match WireClient::send_once(addr, &self.settings.client, statement, self.settings.probe_timeout)
        {
            Ok(response) if response.is_ok() => Some(IoStats::parse(&response.text)),
            Ok(response) => {
                debug!(response = %response.text, "I/O statistics not supported");
                None
            }
            Err(e) => {
                debug!(error = %e, "I/O statistics unavailable");
                None
            }
        }
    }
}

/// Extracts a phase name from `{"phase": ...}`, `phase: x` or bare text.
fn parse_phase(text: &str) -> String {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(text) {
        if let Some(phase) = map.get("phase").and_then(serde_json::Value::as_str) {
            return phase.to_string();
        }
    }
    let trimmed = text.trim();
    match trimmed.split_once([':', '=']) {
        Some((key, value)) if key.trim().eq_ignore_ascii_case("phase") => value.trim().to_string(),
        _ => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(r#"{"phase": "redo"}"#, "redo")]
    #[test_case("phase: analysis", "analysis")]
    #[test_case("PHASE=undo", "undo")]
    #[test_case("complete", "complete")]
    fn test_parse_phase(text: &str, expected: &str) {
        assert_eq!(parse_phase(text), expected);
    }

    #[test]
    fn test_io_stats_json() {
        let stats = IoStats::parse(r#"{"total_io": 42, "read_pages": 30, "write_pages": 12}"#);
        assert_eq!(stats.total_io, Some(42));
        assert_eq!(stats.read_pages, Some(30));
        assert_eq!(stats.write_pages, Some(12));
    }

    #[test]
    fn test_io_stats_pairs_and_unknown_fields() {
        let stats = IoStats::parse("read_pages: 7, write_pages=3");
        assert_eq!(stats.read_pages, Some(7));
        assert_eq!(stats.write_pages, Some(3));
        assert_eq!(stats.total_io, None);

        let unknown = IoStats::parse("nothing useful here");
        assert_eq!(unknown, IoStats {
            raw: "nothing useful here".into(),
            ..IoStats::default()
        });
    }
}
