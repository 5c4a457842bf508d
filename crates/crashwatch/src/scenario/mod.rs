//! Scenarios and the suite orchestrator.
//!
//! Crash scenarios load a schema, run a workload with the fault hook,
//! await recovery and verify the expected state. Isolation scenarios run a
//! fixed interleaving over `mvcc_test` and check the transcripts. Every
//! scenario gets a fresh instance name, work directory and artifact
//! directory, and the server is stopped after it whatever the outcome.

mod crash;
mod isolation;
mod suite;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::report::ScenarioReport;

pub use crash::CrashProfile;
pub use isolation::{MVCC_TABLE, isolation_plan};
pub use suite::Orchestrator;

/// The fixed scenarios, in suite order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioKind {
    SingleThread,
    MultiThread,
    Indexed,
    LargeData,
    NoCheckpoint,
    WithCheckpoint,
    SnapshotIsolation,
    ReadWriteConcurrency,
    WriteWriteConflict,
}

impl ScenarioKind {
    /// Suite order. `NoCheckpoint` precedes `WithCheckpoint` so the
    /// baseline latency is available for the ratio check.
    pub const ALL: [ScenarioKind; 9] = [
        Self::SingleThread,
        Self::MultiThread,
        Self::Indexed,
        Self::LargeData,
        Self::NoCheckpoint,
        Self::WithCheckpoint,
        Self::SnapshotIsolation,
        Self::ReadWriteConcurrency,
        Self::WriteWriteConflict,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::SingleThread => "single-thread",
            Self::MultiThread => "multi-thread",
            Self::Indexed => "indexed",
            Self::LargeData => "large-data",
            Self::NoCheckpoint => "no-checkpoint",
            Self::WithCheckpoint => "with-checkpoint",
            Self::SnapshotIsolation => "snapshot-isolation",
            Self::ReadWriteConcurrency => "read-write-concurrency",
            Self::WriteWriteConflict => "write-write-conflict",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::SingleThread => "single session, small data, autocommit statements",
            Self::MultiThread => "four concurrent sessions with explicit transactions",
            Self::Indexed => "secondary indexes and indexed point queries",
            Self::LargeData => "five sessions over three loaded tables",
            Self::NoCheckpoint => "large load without checkpoints; records t1",
            Self::WithCheckpoint => "large load with periodic checkpoints; records t2",
            Self::SnapshotIsolation => "repeated reads see one snapshot",
            Self::ReadWriteConcurrency => "a writer is not blocked by an open reader",
            Self::WriteWriteConflict => "the second concurrent writer aborts",
        }
    }

    pub fn is_crash(self) -> bool {
        !matches!(
            self,
            Self::SnapshotIsolation | Self::ReadWriteConcurrency | Self::WriteWriteConflict
        )
    }
}

/// What the no-checkpoint scenario left for the checkpoint ratio check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Baseline {
    /// The no-checkpoint scenario was not part of the run.
    #[default]
    NotRun,
    /// It ran but recorded no recovery latency.
    Missing,
    /// Its recovery latency, t1.
    Recorded(Duration),
}

impl Baseline {
    pub fn from_report(report: &ScenarioReport) -> Self {
        report
            .recovery_latency()
            .map_or(Self::Missing, Self::Recorded)
    }

    pub fn latency(self) -> Option<Duration> {
        match self {
            Self::Recorded(t1) => Some(t1),
            Self::NotRun | Self::Missing => None,
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScenarioKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| format!("unknown scenario `{s}`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for kind in ScenarioKind::ALL {
            assert_eq!(kind.name().parse::<ScenarioKind>().unwrap(), kind);
        }
        assert!("nope".parse::<ScenarioKind>().is_err());
    }

    #[test]
    fn test_baseline_runs_before_checkpoint_scenario() {
        let position = |k| ScenarioKind::ALL.iter().position(|x| *x == k).unwrap();
        assert!(position(ScenarioKind::NoCheckpoint) < position(ScenarioKind::WithCheckpoint));
        assert_eq!(ScenarioKind::ALL.iter().filter(|k| k.is_crash()).count(), 6);
    }

    #[test]
    fn test_baseline_without_recovery_is_missing() {
        let report = ScenarioReport::new("no-checkpoint", "/tmp/artifacts");
        assert_eq!(Baseline::from_report(&report), Baseline::Missing);
        assert_eq!(Baseline::from_report(&report).latency(), None);
        assert_eq!(Baseline::default(), Baseline::NotRun);
    }
}
