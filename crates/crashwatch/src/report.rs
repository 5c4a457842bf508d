//! Serializable run records.
//!
//! Rendering is left to consumers; the CLI writes the [`SuiteReport`] as
//! JSON. Durations serialize as fractional milliseconds.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::fault::FaultEvent;
use crate::interleave::SessionTranscript;
use crate::recovery::RecoveryRecord;
use crate::verify::ConsistencyReport;
use crate::workload::ExecutionReport;

/// Outcome of one scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub passed: bool,
    /// Harness failure or the reason the scenario failed.
    pub failure: Option<String>,
    /// Set when the scenario did not run.
    pub skipped: Option<String>,
    pub executions: Vec<ExecutionReport>,
    pub fault: Option<FaultEvent>,
    pub recovery: Option<RecoveryRecord>,
    pub transcripts: Vec<SessionTranscript>,
    pub consistency: ConsistencyReport,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    /// Directory holding server output and the interaction log.
    pub artifacts: PathBuf,
}

impl ScenarioReport {
    pub fn new(name: impl Into<String>, artifacts: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            failure: None,
            skipped: None,
            executions: Vec::new(),
            fault: None,
            recovery: None,
            transcripts: Vec::new(),
            consistency: ConsistencyReport::default(),
            elapsed: Duration::ZERO,
            artifacts: artifacts.into(),
        }
    }

    /// Marks the scenario failed, keeping the first reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.passed = false;
        if self.failure.is_none() {
            self.failure = Some(reason.into());
        }
    }

    pub fn recovery_latency(&self) -> Option<Duration> {
        self.recovery
            .as_ref()
            .filter(|r| r.recovered())
            .map(|r| r.latency)
    }
}

/// Outcome of a suite run.
#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub started_at: DateTime<Utc>,
    pub scenarios: Vec<ScenarioReport>,
    /// Recovery latency without checkpoints.
    #[serde(with = "duration_ms::option")]
    pub t1: Option<Duration>,
    /// Recovery latency with periodic checkpoints.
    #[serde(with = "duration_ms::option")]
    pub t2: Option<Duration>,
    pub passed: bool,
}

impl SuiteReport {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            scenarios: Vec::new(),
            t1: None,
            t2: None,
            passed: true,
        }
    }

    pub fn push(&mut self, report: ScenarioReport) {
        self.passed = self.passed && (report.passed || report.skipped.is_some());
        self.scenarios.push(report);
    }

    pub fn failed(&self) -> impl Iterator<Item = &ScenarioReport> {
        self.scenarios
            .iter()
            .filter(|r| !r.passed && r.skipped.is_none())
    }
}

impl Default for SuiteReport {
    fn default() -> Self {
        Self::new()
    }
}

/// `Duration` as fractional milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
    }

    pub mod option {
        use std::time::Duration;

        use serde::Serializer;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&(d.as_secs_f64() * 1000.0)),
                None => serializer.serialize_none(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durations_serialize_as_ms() {
        let mut report = ScenarioReport::new("single-thread", "/tmp/a");
        report.elapsed = Duration::from_millis(1500);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["elapsed"], serde_json::json!(1500.0));

        let mut suite = SuiteReport::new();
        suite.t1 = Some(Duration::from_millis(250));
        let json = serde_json::to_value(&suite).unwrap();
        assert_eq!(json["t1"], serde_json::json!(250.0));
        assert!(json["t2"].is_null());
    }

    #[test]
    fn test_suite_verdict() {
        let mut suite = SuiteReport::new();
        let mut skipped = ScenarioReport::new("with-checkpoint", "/tmp/b");
        skipped.skipped = Some("disabled".into());
        suite.push(skipped);
        assert!(suite.passed);

        let mut failed = ScenarioReport::new("indexed", "/tmp/c");
        failed.fail("recovery timed out");
        failed.fail("second reason");
        assert_eq!(failed.failure.as_deref(), Some("recovery timed out"));
        suite.push(failed);
        assert!(!suite.passed);
        assert_eq!(suite.failed().count(), 1);
    }
}
